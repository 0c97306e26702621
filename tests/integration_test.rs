use hotmod::loader::Artifact;
use hotmod::{
    create_module, AsyncRunner, Config, HmrError, HmrRuntime, HotModule, ImmediateRunner,
    ManualWatcher, PersistManager, RunnerKind, RuntimeConfig, SyntheticLoader, UpdateCause,
    UpdateEvent, Watcher,
};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

type Modules = Arc<Mutex<HashMap<String, fn() -> HotModule>>>;

fn runtime_over(modules: &Modules, config: RuntimeConfig) -> (HmrRuntime, Arc<ManualWatcher>) {
    let table = Arc::clone(modules);
    let loader = SyntheticLoader::new(move |id| {
        let constructor = table.lock().unwrap().get(id).copied();
        match constructor {
            Some(constructor) => Ok(constructor().into_artifact()),
            None => Err(anyhow::anyhow!("Cannot find module {}", id)),
        }
    });
    let watcher = Arc::new(ManualWatcher::new());
    let runtime = HmrRuntime::new(
        Arc::new(loader),
        Some(Arc::clone(&watcher) as Arc<dyn Watcher>),
        config,
    );
    (runtime, watcher)
}

fn install(modules: &Modules, id: &str, constructor: fn() -> HotModule) {
    modules
        .lock()
        .unwrap()
        .insert(id.to_string(), constructor);
}

async fn next_update(rx: &mut tokio::sync::broadcast::Receiver<UpdateEvent>) -> UpdateEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no update published")
        .expect("update channel closed")
}

// A unit that keeps a listening socket across reloads
fn greeter(greeting: &'static str) -> HotModule {
    HotModule::builder()
        .persist(PersistManager::new_async(
            || async { Ok::<_, anyhow::Error>(TcpListener::bind("127.0.0.1:0").await?) },
            |_listener: Arc<TcpListener>| async { Ok::<_, anyhow::Error>(()) },
        ))
        .runner(AsyncRunner::from_fn(
            move |listener: Arc<TcpListener>, _| async move {
                let addr: SocketAddr = listener.local_addr()?;
                Ok::<_, anyhow::Error>(format!("{} from {}", greeting, addr))
            },
        ))
        .build()
        .expect("runner is set")
}

fn greeter_v1() -> HotModule {
    greeter("hello")
}

fn greeter_v2() -> HotModule {
    greeter("bonjour")
}

#[tokio::test]
async fn test_config_from_file() {
    let config_content = r#"
[runtime]
logging = true
transition_timeout_ms = 2500

[watcher]
debounce_ms = 150
"#;

    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("Failed to write to temp file");
    let temp_path = temp_file.path().to_str().unwrap();

    let config = Config::load(temp_path).await.expect("Failed to load config");

    assert!(config.runtime.logging);
    assert!(!config.runtime.suppress_warnings);
    assert_eq!(
        config.runtime.transition_timeout(),
        Some(Duration::from_millis(2500))
    );
    assert_eq!(config.watcher.debounce_ms, 150);
    assert_eq!(config.watcher.poll_interval_ms, 100);
}

#[tokio::test]
async fn test_persistent_socket_survives_reload() {
    let modules: Modules = Arc::default();
    install(&modules, "greeter", greeter_v1);
    let (runtime, watcher) = runtime_over(&modules, RuntimeConfig::default());

    let cell = runtime.import("greeter").await.unwrap();
    let first = cell.get_as::<String>().unwrap();
    assert!(first.starts_with("hello from 127.0.0.1:"));

    let mut rx = runtime.subscribe();
    install(&modules, "greeter", greeter_v2);
    assert_eq!(watcher.trigger(["greeter"]), 1);

    let event = next_update(&mut rx).await;
    assert_eq!(event.cause, UpdateCause::CodeChanged);

    let second = cell.get_as::<String>().unwrap();
    assert!(second.starts_with("bonjour from "));
    let port = |s: &str| s.rsplit(':').next().map(str::to_string);
    assert_eq!(port(&first), port(&second));
}

#[tokio::test]
async fn test_independent_runtimes() {
    let modules: Modules = Arc::default();
    install(&modules, "greeter", greeter_v1);

    let (quiet, _) = runtime_over(&modules, RuntimeConfig::default().with_watch_disabled(true));
    let (loud, loud_watcher) = runtime_over(&modules, RuntimeConfig::default().with_logging(true));

    let a = quiet.import("greeter").await.unwrap();
    let b = loud.import("greeter").await.unwrap();

    assert!(!a.ptr_eq(&b));
    assert_eq!(quiet.stats().watched, 0);
    assert!(loud_watcher.is_watching("greeter"));
    // Each runtime bound its own socket
    assert_ne!(a.get_as::<String>(), b.get_as::<String>());
}

#[tokio::test]
async fn test_unknown_unit_and_invalid_usage() {
    let modules: Modules = Arc::default();
    let (runtime, _) = runtime_over(&modules, RuntimeConfig::default());

    let err = tokio_test::assert_err!(runtime.import("missing").await);
    assert!(matches!(err, HmrError::LoadFailure { .. }));
    assert_eq!(err.id(), Some("missing"));

    assert!(matches!(
        runtime.exports("missing"),
        Err(HmrError::NotImported(_))
    ));
    runtime.unimport("missing").await;
    assert!(runtime.imported_ids().is_empty());
}

#[tokio::test]
async fn test_builder_rejects_module_without_runner() {
    let err = HotModule::builder()
        .persist(PersistManager::empty())
        .build()
        .unwrap_err();
    assert!(matches!(err, HmrError::IncompleteModule("runner")));

    let module = create_module(
        PersistManager::empty(),
        ImmediateRunner::from_fn(|_: &(), _| Ok(1u8)),
        true,
    );
    assert_eq!(module.runner().kind(), RunnerKind::Immediate);
    assert!(module.update_persistent_values());
}

#[tokio::test]
async fn test_shared_cache_and_contract_check() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let loader = SyntheticLoader::new(move |id| {
        counter.fetch_add(1, Ordering::SeqCst);
        match id {
            "plain" => Ok(Arc::new(42u32) as Artifact),
            _ => Ok(greeter_v1().into_artifact()),
        }
    });
    let cache = loader.cache();
    let runtime = HmrRuntime::new(Arc::new(loader), None, RuntimeConfig::default());

    let err = runtime.import("plain").await.unwrap_err();
    assert!(matches!(err, HmrError::ContractViolation { .. }));

    tokio_test::assert_ok!(runtime.import("greeter").await);
    tokio_test::assert_ok!(runtime.import("greeter").await);
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert!(cache.lock().contains_key("greeter"));

    runtime.unimport("greeter").await;
    assert!(!cache.lock().contains_key("greeter"));
}
