//! Reload orchestrator.
//!
//! `HmrRuntime` owns every per-unit record (persistent state, current module,
//! export cell, watch handle), drives the upgrade transition and turns watcher
//! notifications into reloads.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::core::cell::ExportCell;
use crate::core::error::{HmrError, Result, TransitionStage};
use crate::core::events::{EventBus, ListenerId, UpdateEmitter, UpdateEvent};
use crate::core::module::{HotModule, Persistent};
use crate::loader::Loader;
use crate::watcher::{Unsubscribe, WatchEvent, Watcher};

const UPDATE_CAPACITY: usize = 256;

/// Run one step of a unit body, turning a panic into an error
async fn contain<T, F>(step: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(step).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Snapshot of the runtime's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub imported: usize,
    pub watched: usize,
    pub cached_artifacts: usize,
}

#[derive(Default)]
struct UnitState {
    persistent: Option<Persistent>,
    module: Option<Arc<HotModule>>,
    /// Completed upgrade transitions
    transitions: u64,
    /// Set once the record has been unimported or discarded
    retired: bool,
}

struct UnitSlot {
    id: String,
    cell: ExportCell,
    state: Arc<AsyncMutex<UnitState>>,
    imported: AtomicBool,
    reload_queued: AtomicBool,
}

impl UnitSlot {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            cell: ExportCell::new(id),
            state: Arc::new(AsyncMutex::new(UnitState::default())),
            imported: AtomicBool::new(false),
            reload_queued: AtomicBool::new(false),
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    loader: Arc<dyn Loader>,
    watcher: Option<Arc<dyn Watcher>>,
    bus: EventBus,
    /// Last good module per id
    artifacts: Mutex<HashMap<String, Arc<HotModule>>>,
    invalidated: Mutex<HashSet<String>>,
    units: Mutex<HashMap<String, Arc<UnitSlot>>>,
    watches: Mutex<HashMap<String, Unsubscribe>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Hot module runtime.
///
/// Cheap to clone; clones share the same records. Several runtimes can live
/// in one process, each with its own configuration.
#[derive(Clone)]
pub struct HmrRuntime {
    inner: Arc<RuntimeInner>,
}

impl HmrRuntime {
    pub fn new(
        loader: Arc<dyn Loader>,
        watcher: Option<Arc<dyn Watcher>>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                loader,
                watcher,
                bus: EventBus::new(UPDATE_CAPACITY),
                artifacts: Mutex::new(HashMap::new()),
                invalidated: Mutex::new(HashSet::new()),
                units: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Load `id`, run its upgrade transition and start watching it.
    ///
    /// The returned cell is the same for every import of `id` until it is
    /// unimported; reloads replace its contents in place. If the very first
    /// transition of a unit fails, its record is discarded and the error is
    /// returned.
    pub async fn import(&self, id: &str) -> Result<ExportCell> {
        let inner = &self.inner;
        let module = inner.load_module(id, None).await?;

        let (slot, mut state) = inner.lock_live_slot(id).await;
        if let Err(err) = inner.upgrade(&slot, &mut state, module).await {
            if state.transitions == 0 {
                inner.discard(&slot, &mut state).await;
            }
            return Err(err);
        }
        slot.imported.store(true, Ordering::SeqCst);
        drop(state);

        inner.ensure_watching(id)?;
        Ok(slot.cell.clone())
    }

    /// Reload `id` now, as if its watcher had fired, and wait for the result
    pub async fn reload(&self, id: &str) -> Result<()> {
        let inner = &self.inner;
        let slot = inner
            .imported_slot(id)
            .ok_or_else(|| HmrError::NotImported(id.to_string()))?;

        inner.mark_invalidated(id);
        if inner.run_reload(&slot, false).await? {
            Ok(())
        } else {
            Err(HmrError::NotImported(id.to_string()))
        }
    }

    /// Stop watching `id`, forget its cached code and dispose of its
    /// persistent state. Waits for an in-flight transition first. The runner's
    /// `clean` is not called.
    pub async fn unimport(&self, id: &str) {
        let inner = &self.inner;

        let watch = inner.watches.lock().remove(id);
        if let Some(handle) = watch {
            handle.unsubscribe();
        }

        let slot = inner.units.lock().remove(id);
        let slot = match slot {
            Some(slot) => slot,
            None => {
                inner.forget_artifacts(id);
                debug!("Unimport of {} ignored: not imported", id);
                return;
            }
        };

        // An in-flight transition may still cache what it loaded
        let mut state = slot.state.lock().await;
        inner.forget_artifacts(id);
        inner.retire(&slot.id, &mut state).await;
        if inner.config.logging {
            info!("📤 Unimported module {}", id);
        }
    }

    /// Stop every watch. Persistent state and exports are left in place.
    pub fn close_all(&self) {
        let handles: Vec<(String, Unsubscribe)> = self.inner.watches.lock().drain().collect();
        for (id, handle) in handles {
            handle.unsubscribe();
            debug!("🛑 Closed watch for {}", id);
        }
    }

    pub fn exports(&self, id: &str) -> Result<ExportCell> {
        self.inner
            .imported_slot(id)
            .map(|slot| slot.cell.clone())
            .ok_or_else(|| HmrError::NotImported(id.to_string()))
    }

    pub fn is_imported(&self, id: &str) -> bool {
        self.inner.imported_slot(id).is_some()
    }

    pub fn imported_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .units
            .lock()
            .values()
            .filter(|slot| slot.imported.load(Ordering::SeqCst))
            .map(|slot| slot.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            imported: self.imported_ids().len(),
            watched: self.inner.watches.lock().len(),
            cached_artifacts: self.inner.artifacts.lock().len(),
        }
    }

    /// Receiver for every update published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.inner.bus.subscribe()
    }

    /// Stream of updates; lagged events are skipped
    pub fn updates(&self) -> impl Stream<Item = UpdateEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(Arc::new(listener), false)
    }

    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(Arc::new(listener), true)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    /// Callback listeners still registered
    pub fn listener_count(&self) -> usize {
        self.inner.bus.listener_count()
    }
}

impl RuntimeInner {
    fn imported_slot(&self, id: &str) -> Option<Arc<UnitSlot>> {
        self.units
            .lock()
            .get(id)
            .filter(|slot| slot.imported.load(Ordering::SeqCst))
            .cloned()
    }

    /// Whether `slot` is still the record registered for its id
    fn is_current(&self, slot: &Arc<UnitSlot>) -> bool {
        self.units
            .lock()
            .get(&slot.id)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
    }

    /// Lock the record for `id`, creating it if needed. A record retired by a
    /// concurrent unimport is replaced by a fresh one.
    async fn lock_live_slot(&self, id: &str) -> (Arc<UnitSlot>, OwnedMutexGuard<UnitState>) {
        loop {
            let slot = {
                let mut units = self.units.lock();
                Arc::clone(
                    units
                        .entry(id.to_string())
                        .or_insert_with(|| Arc::new(UnitSlot::new(id))),
                )
            };

            let state = Arc::clone(&slot.state).lock_owned().await;
            if !state.retired {
                return (slot, state);
            }
        }
    }

    /// Load `id`, or reuse its cached module while it is not invalidated.
    /// A module loaded for a record that has since been unimported is not
    /// cached.
    async fn load_module(
        &self,
        id: &str,
        owner: Option<&Arc<UnitSlot>>,
    ) -> Result<Arc<HotModule>> {
        let invalidated = self.invalidated.lock().contains(id);
        let cached = self.artifacts.lock().get(id).cloned();

        if !invalidated {
            if let Some(module) = cached {
                return Ok(module);
            }
        }

        match self.loader.load(id).await {
            Ok(artifact) => {
                let module = HotModule::from_artifact(id, artifact).map_err(|e| {
                    error!("❌ {}", e);
                    e
                })?;
                if owner.map_or(true, |slot| self.is_current(slot)) {
                    self.artifacts
                        .lock()
                        .insert(id.to_string(), Arc::clone(&module));
                    self.invalidated.lock().remove(id);
                }
                Ok(module)
            }
            Err(source) => {
                error!("❌ Error in import of {}: {:#}", id, source);
                match cached {
                    Some(module) => {
                        if !self.config.suppress_warnings {
                            warn!("⚠️ Using cached import of {}", id);
                        }
                        Ok(module)
                    }
                    None => {
                        error!("❌ No cached import of {}, unable to continue", id);
                        Err(HmrError::LoadFailure {
                            id: id.to_string(),
                            source,
                        })
                    }
                }
            }
        }
    }

    fn mark_invalidated(&self, id: &str) {
        self.invalidated.lock().insert(id.to_string());
        match self.loader.resolve(id) {
            Ok(key) => self.loader.invalidate(&key),
            Err(e) => debug!("Could not resolve {} for invalidation: {}", id, e),
        }
    }

    fn forget_artifacts(&self, id: &str) {
        self.artifacts.lock().remove(id);
        self.invalidated.lock().remove(id);
        if let Ok(key) = self.loader.resolve(id) {
            self.loader.invalidate(&key);
        }
    }

    async fn upgrade(
        &self,
        slot: &UnitSlot,
        state: &mut UnitState,
        module: Arc<HotModule>,
    ) -> Result<()> {
        let result = self.transition(slot, state, module).await;
        if let Err(e) = &result {
            error!("❌ {}", e);
        }
        result
    }

    async fn transition(
        &self,
        slot: &UnitSlot,
        state: &mut UnitState,
        module: Arc<HotModule>,
    ) -> Result<()> {
        let id = slot.id.as_str();

        let persistent = match state.persistent.clone() {
            Some(existing) if !module.update_persistent_values() => existing,
            existing => {
                if let (Some(previous), Some(old)) = (state.module.clone(), existing) {
                    contain(async { previous.persist_manager().cleanup(old).await })
                        .await
                        .map_err(|source| HmrError::PersistCleanup {
                            id: id.to_string(),
                            source,
                        })?;
                    state.persistent = None;
                }

                let generated = self
                    .guard(id, TransitionStage::Generate, async {
                        module.persist_manager().generate().await
                    })
                    .await?;
                state.persistent = Some(Arc::clone(&generated));
                generated
            }
        };

        if let (Some(previous), Some(exports)) = (state.module.clone(), slot.cell.get()) {
            contain(previous.runner().clean(&persistent, &exports))
                .await
                .map_err(|source| HmrError::RunnerClean {
                    id: id.to_string(),
                    source,
                })?;
        }

        state.module = Some(Arc::clone(&module));

        let emitter = UpdateEmitter::new(id, self.bus.clone());
        let exports = self
            .guard(
                id,
                TransitionStage::Execute,
                module.runner().execute(&persistent, emitter),
            )
            .await?;

        slot.cell.replace(exports);
        state.transitions += 1;
        debug!("✅ Module {} at transition {}", id, state.transitions);
        Ok(())
    }

    /// Apply the transition timeout to one lifecycle step
    async fn guard<T, F>(&self, id: &str, stage: TransitionStage, step: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let step = contain(step);
        let outcome = match self.config.transition_timeout() {
            Some(after) => match tokio::time::timeout(after, step).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(HmrError::Timeout {
                        id: id.to_string(),
                        stage,
                        after,
                    })
                }
            },
            None => step.await,
        };

        outcome.map_err(|source| match stage {
            TransitionStage::Generate => HmrError::Generate {
                id: id.to_string(),
                source,
            },
            TransitionStage::Execute => HmrError::Execute {
                id: id.to_string(),
                source,
            },
        })
    }

    /// Drop a record whose first transition never completed
    async fn discard(&self, slot: &Arc<UnitSlot>, state: &mut UnitState) {
        self.retire(&slot.id, state).await;

        let removed = {
            let mut units = self.units.lock();
            match units.get(&slot.id) {
                Some(current) if Arc::ptr_eq(current, slot) => units.remove(&slot.id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.forget_artifacts(&slot.id);
        }
        debug!("🗑️ Discarded failed import of {}", slot.id);
    }

    async fn retire(&self, id: &str, state: &mut UnitState) {
        state.retired = true;
        let module = state.module.take();
        let persistent = state.persistent.take();

        if let (Some(module), Some(persistent)) = (module, persistent) {
            let cleanup = contain(async { module.persist_manager().cleanup(persistent).await });
            if let Err(source) = cleanup.await {
                error!(
                    "❌ {}",
                    HmrError::PersistCleanup {
                        id: id.to_string(),
                        source,
                    }
                );
            }
        }
    }

    fn ensure_watching(self: &Arc<Self>, id: &str) -> Result<()> {
        if self.config.watch_disabled {
            return Ok(());
        }
        let watcher = match &self.watcher {
            Some(watcher) => Arc::clone(watcher),
            None => return Ok(()),
        };

        self.ensure_pump(&watcher);

        if self.watches.lock().contains_key(id) {
            return Ok(());
        }

        let handle = watcher.watch(id).map_err(|source| {
            let err = HmrError::Watch {
                id: id.to_string(),
                source,
            };
            error!("❌ {}", err);
            err
        })?;

        let mut watches = self.watches.lock();
        if watches.contains_key(id) {
            handle.unsubscribe();
        } else {
            watches.insert(id.to_string(), handle);
        }
        Ok(())
    }

    /// Forward watcher notifications to `schedule_reload` until the runtime is
    /// dropped
    fn ensure_pump(self: &Arc<Self>, watcher: &Arc<dyn Watcher>) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let mut receiver = watcher.subscribe();
        let runtime: Weak<RuntimeInner> = Arc::downgrade(self);
        *pump = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(WatchEvent::Update(ids)) => {
                        let inner = match runtime.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        for id in &ids {
                            let watched = inner.watches.lock().contains_key(id);
                            if watched {
                                inner.schedule_reload(id);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("⚠️ Watcher events lagged, skipped {}", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Watcher channel closed");
                        break;
                    }
                }
            }
        }));
    }

    /// Queue a reload of `id`. Requests arriving before the queued reload has
    /// started are folded into it.
    fn schedule_reload(self: &Arc<Self>, id: &str) {
        let slot = match self.units.lock().get(id).cloned() {
            Some(slot) => slot,
            None => return,
        };

        self.mark_invalidated(id);
        if slot.reload_queued.swap(true, Ordering::SeqCst) {
            debug!("🔁 Reload of {} already queued", id);
            return;
        }

        if self.config.logging {
            info!("🔄 Module {} updated! clearing cache and updating exports...", id);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.run_reload(&slot, true).await {
                Ok(true) => debug!("Reload of {} finished", slot.id),
                Ok(false) => debug!("Reload of {} skipped: unimported", slot.id),
                Err(e) => debug!("Reload of {} abandoned: {}", slot.id, e),
            }
        });
    }

    /// Reload the unit behind `slot` and announce it. Returns `false` when
    /// the unit was unimported before or during the reload.
    async fn run_reload(&self, slot: &Arc<UnitSlot>, from_queue: bool) -> Result<bool> {
        let mut state = slot.state.lock().await;
        if from_queue {
            slot.reload_queued.store(false, Ordering::SeqCst);
        }
        if state.retired || !self.is_current(slot) {
            return Ok(false);
        }

        let module = self.load_module(&slot.id, Some(slot)).await?;
        if !self.is_current(slot) {
            return Ok(false);
        }
        self.upgrade(slot, &mut state, module).await?;

        if self.is_current(slot) {
            self.bus.publish(UpdateEvent::code_changed(slot.id.as_str()));
        }
        Ok(true)
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        for (_, handle) in self.watches.get_mut().drain() {
            handle.unsubscribe();
        }
    }
}
