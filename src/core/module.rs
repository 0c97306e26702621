//! The hot module contract.
//!
//! A hot module pairs a [`PersistManager`] (state that survives reloads) with
//! a [`Runner`] (the body that turns that state into exports). Both hold
//! type-erased closures; the typed constructors downcast on the way in so the
//! runtime never has to know a unit's state or export types.

use futures::future::{self, BoxFuture, FutureExt};
use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::core::error::{HmrError, Result};
use crate::core::events::UpdateEmitter;
use crate::loader::Artifact;

/// Opaque, unit-owned state kept across reloads
pub type Persistent = Arc<dyn Any + Send + Sync>;

/// Opaque output of a unit body
pub type Exports = Arc<dyn Any + Send + Sync>;

type GenerateFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Persistent>> + Send + Sync>;
type DisposeFn = Box<dyn Fn(Persistent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type ImmediateExecuteFn =
    Box<dyn Fn(&Persistent, UpdateEmitter) -> anyhow::Result<Exports> + Send + Sync>;
type ImmediateCleanFn = Box<dyn Fn(&Persistent, &Exports) -> anyhow::Result<()> + Send + Sync>;
type AsyncExecuteFn = Box<
    dyn Fn(Persistent, UpdateEmitter) -> BoxFuture<'static, anyhow::Result<Exports>> + Send + Sync,
>;
type AsyncCleanFn =
    Box<dyn Fn(Persistent, Exports) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn downcast_ref<'a, T: Any>(value: &'a (dyn Any + Send + Sync), what: &str) -> anyhow::Result<&'a T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow::anyhow!("{} is not a {}", what, type_name::<T>()))
}

fn downcast_arc<T: Any + Send + Sync>(
    value: Arc<dyn Any + Send + Sync>,
    what: &str,
) -> anyhow::Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| anyhow::anyhow!("{} is not a {}", what, type_name::<T>()))
}

/// Produces and disposes of a unit's persistent state
pub struct PersistManager {
    generate: GenerateFn,
    cleanup: DisposeFn,
}

impl PersistManager {
    /// Synchronous recipe.
    ///
    /// `generate` runs on the first import, and on every reload of a module
    /// that sets `update_persistent_values`. `cleanup` disposes of the state
    /// before it is regenerated and on unimport.
    pub fn new<P, G, C>(generate: G, cleanup: C) -> Self
    where
        P: Any + Send + Sync,
        G: Fn() -> anyhow::Result<P> + Send + Sync + 'static,
        C: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            generate: Box::new(move || {
                future::ready(generate().map(|p| Arc::new(p) as Persistent)).boxed()
            }),
            cleanup: Box::new(move |persistent: Persistent| {
                let result =
                    downcast_ref::<P>(&*persistent, "persistent state").and_then(|p| cleanup(p));
                future::ready(result).boxed()
            }),
        }
    }

    /// Asynchronous recipe, for state such as listening sockets
    pub fn new_async<P, G, GF, C, CF>(generate: G, cleanup: C) -> Self
    where
        P: Any + Send + Sync,
        G: Fn() -> GF + Send + Sync + 'static,
        GF: Future<Output = anyhow::Result<P>> + Send + 'static,
        C: Fn(Arc<P>) -> CF + Send + Sync + 'static,
        CF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            generate: Box::new(move || {
                generate()
                    .map(|result| result.map(|p| Arc::new(p) as Persistent))
                    .boxed()
            }),
            cleanup: Box::new(move |persistent: Persistent| {
                match downcast_arc::<P>(persistent, "persistent state") {
                    Ok(p) => cleanup(p).boxed(),
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            }),
        }
    }

    /// Neutral manager for units without persistent state
    pub fn empty() -> Self {
        Self::new(|| Ok(()), |_: &()| Ok(()))
    }

    pub(crate) fn generate(&self) -> BoxFuture<'static, anyhow::Result<Persistent>> {
        (self.generate)()
    }

    pub(crate) fn cleanup(&self, persistent: Persistent) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.cleanup)(persistent)
    }
}

impl Default for PersistManager {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PersistManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistManager").finish_non_exhaustive()
    }
}

/// Runner whose body returns its exports directly
pub struct ImmediateRunner {
    execute: ImmediateExecuteFn,
    clean: ImmediateCleanFn,
}

impl ImmediateRunner {
    pub fn new<P, E, X, C>(execute: X, clean: C) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(&P, UpdateEmitter) -> anyhow::Result<E> + Send + Sync + 'static,
        C: Fn(&P, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            execute: Box::new(
                move |persistent: &Persistent, emitter: UpdateEmitter| -> anyhow::Result<Exports> {
                    let p = downcast_ref::<P>(&**persistent, "persistent state")?;
                    let exports = execute(p, emitter)?;
                    Ok(Arc::new(exports) as Exports)
                },
            ),
            clean: Box::new(
                move |persistent: &Persistent, exports: &Exports| -> anyhow::Result<()> {
                    let p = downcast_ref::<P>(&**persistent, "persistent state")?;
                    let e = downcast_ref::<E>(&**exports, "exports")?;
                    clean(p, e)
                },
            ),
        }
    }

    /// Body with nothing to tear down between runs
    pub fn from_fn<P, E, X>(execute: X) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(&P, UpdateEmitter) -> anyhow::Result<E> + Send + Sync + 'static,
    {
        Self::new(execute, |_: &P, _: &E| Ok(()))
    }
}

/// Runner whose body is a future
pub struct AsyncRunner {
    execute: AsyncExecuteFn,
    clean: AsyncCleanFn,
}

impl AsyncRunner {
    pub fn new<P, E, X, XF, C, CF>(execute: X, clean: C) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(Arc<P>, UpdateEmitter) -> XF + Send + Sync + 'static,
        XF: Future<Output = anyhow::Result<E>> + Send + 'static,
        C: Fn(Arc<P>, Arc<E>) -> CF + Send + Sync + 'static,
        CF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            execute: Box::new(move |persistent: Persistent, emitter: UpdateEmitter| {
                match downcast_arc::<P>(persistent, "persistent state") {
                    Ok(p) => execute(p, emitter)
                        .map(|result| result.map(|e| Arc::new(e) as Exports))
                        .boxed(),
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            }),
            clean: Box::new(move |persistent: Persistent, exports: Exports| {
                let typed = downcast_arc::<P>(persistent, "persistent state")
                    .and_then(|p| Ok((p, downcast_arc::<E>(exports, "exports")?)));
                match typed {
                    Ok((p, e)) => clean(p, e).boxed(),
                    Err(err) => future::ready(Err(err)).boxed(),
                }
            }),
        }
    }

    pub fn from_fn<P, E, X, XF>(execute: X) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(Arc<P>, UpdateEmitter) -> XF + Send + Sync + 'static,
        XF: Future<Output = anyhow::Result<E>> + Send + 'static,
    {
        Self::new(execute, |_: Arc<P>, _: Arc<E>| future::ready(Ok(())))
    }
}

/// Discriminant of a [`Runner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Immediate,
    Async,
}

/// Produces a unit's exports from its persistent state and tears them down
/// before the next run
pub enum Runner {
    Immediate(ImmediateRunner),
    Async(AsyncRunner),
}

impl Runner {
    pub fn immediate<P, E, X, C>(execute: X, clean: C) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(&P, UpdateEmitter) -> anyhow::Result<E> + Send + Sync + 'static,
        C: Fn(&P, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Runner::Immediate(ImmediateRunner::new(execute, clean))
    }

    pub fn asynchronous<P, E, X, XF, C, CF>(execute: X, clean: C) -> Self
    where
        P: Any + Send + Sync,
        E: Any + Send + Sync,
        X: Fn(Arc<P>, UpdateEmitter) -> XF + Send + Sync + 'static,
        XF: Future<Output = anyhow::Result<E>> + Send + 'static,
        C: Fn(Arc<P>, Arc<E>) -> CF + Send + Sync + 'static,
        CF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Runner::Async(AsyncRunner::new(execute, clean))
    }

    pub fn kind(&self) -> RunnerKind {
        match self {
            Runner::Immediate(_) => RunnerKind::Immediate,
            Runner::Async(_) => RunnerKind::Async,
        }
    }

    pub(crate) async fn execute(
        &self,
        persistent: &Persistent,
        emitter: UpdateEmitter,
    ) -> anyhow::Result<Exports> {
        match self {
            Runner::Immediate(runner) => (runner.execute)(persistent, emitter),
            Runner::Async(runner) => (runner.execute)(Arc::clone(persistent), emitter).await,
        }
    }

    pub(crate) async fn clean(&self, persistent: &Persistent, exports: &Exports) -> anyhow::Result<()> {
        match self {
            Runner::Immediate(runner) => (runner.clean)(persistent, exports),
            Runner::Async(runner) => {
                (runner.clean)(Arc::clone(persistent), Arc::clone(exports)).await
            }
        }
    }
}

impl From<ImmediateRunner> for Runner {
    fn from(runner: ImmediateRunner) -> Self {
        Runner::Immediate(runner)
    }
}

impl From<AsyncRunner> for Runner {
    fn from(runner: AsyncRunner) -> Self {
        Runner::Async(runner)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runner").field(&self.kind()).finish()
    }
}

/// A reloadable unit as produced by a loader
pub struct HotModule {
    persist: PersistManager,
    runner: Runner,
    update_persistent_values: bool,
    // Loader resources tied to this module, released after the closures above
    anchor: Option<Arc<dyn Any + Send + Sync>>,
}

impl HotModule {
    pub fn builder() -> HotModuleBuilder {
        HotModuleBuilder::default()
    }

    pub fn persist_manager(&self) -> &PersistManager {
        &self.persist
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Whether every reload regenerates persistent state
    pub fn update_persistent_values(&self) -> bool {
        self.update_persistent_values
    }

    pub fn into_artifact(self) -> Artifact {
        Arc::new(self)
    }

    /// Accept a loaded artifact only if it is a hot module
    pub fn from_artifact(id: &str, artifact: Artifact) -> Result<Arc<HotModule>> {
        artifact
            .downcast::<HotModule>()
            .map_err(|_| HmrError::ContractViolation {
                id: id.to_string(),
                reason: "artifact is not a hot module with a persist manager and a runner"
                    .to_string(),
            })
    }

    pub(crate) fn with_anchor(mut self, anchor: Arc<dyn Any + Send + Sync>) -> Self {
        self.anchor = Some(anchor);
        self
    }
}

impl fmt::Debug for HotModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotModule")
            .field("runner", &self.runner)
            .field("update_persistent_values", &self.update_persistent_values)
            .field("anchored", &self.anchor.is_some())
            .finish()
    }
}

/// Assembles a [`HotModule`], refusing to build one without a runner
#[derive(Default)]
pub struct HotModuleBuilder {
    persist: Option<PersistManager>,
    runner: Option<Runner>,
    update_persistent_values: bool,
}

impl HotModuleBuilder {
    pub fn persist(mut self, persist: PersistManager) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn runner(mut self, runner: impl Into<Runner>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    pub fn update_persistent_values(mut self, update: bool) -> Self {
        self.update_persistent_values = update;
        self
    }

    pub fn build(self) -> Result<HotModule> {
        let runner = self.runner.ok_or(HmrError::IncompleteModule("runner"))?;
        Ok(HotModule {
            persist: self.persist.unwrap_or_default(),
            runner,
            update_persistent_values: self.update_persistent_values,
            anchor: None,
        })
    }
}

/// Shorthand for a complete module
pub fn create_module(
    persist: PersistManager,
    runner: impl Into<Runner>,
    force_update: bool,
) -> HotModule {
    HotModule {
        persist,
        runner: runner.into(),
        update_persistent_values: force_update,
        anchor: None,
    }
}
