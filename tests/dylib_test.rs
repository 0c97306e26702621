//! Reloads a real unit library built from a small fixture crate.

use hotmod::loader::resident_libraries;
use hotmod::{DylibLoader, HmrRuntime, RuntimeConfig, RuntimeStats};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;

const UNIT: &str = "counter_unit";

const UNIT_SOURCE: &str = r#"
use hotmod::{create_module, HotModule, ImmediateRunner, PersistManager};

const VERSION: &str = env!("COUNTER_UNIT_VERSION");

fn module() -> HotModule {
    create_module(
        PersistManager::new(|| Ok(format!("{}-state", VERSION)), |_: &String| Ok(())),
        ImmediateRunner::from_fn(|state: &String, _| Ok(format!("{}:{}", VERSION, state))),
        false,
    )
}

hotmod::export_hot_module!(module);
"#;

/// Crate producing the unit library, rebuilt once per version
struct Fixture {
    dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(UNIT);
        std::fs::create_dir_all(dir.join("src")).unwrap();

        let manifest = format!(
            r#"[package]
name = "{unit}"
version = "0.1.0"
edition = "2021"

[lib]
crate-type = ["cdylib"]

[dependencies]
hotmod = {{ path = '{host}' }}

[workspace]
"#,
            unit = UNIT,
            host = env!("CARGO_MANIFEST_DIR"),
        );
        std::fs::write(dir.join("Cargo.toml"), manifest).unwrap();
        std::fs::write(dir.join("src/lib.rs"), UNIT_SOURCE).unwrap();

        // Same dependency versions as the host
        let lock = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.lock");
        if lock.exists() {
            std::fs::copy(&lock, dir.join("Cargo.lock")).unwrap();
        }

        Self { dir }
    }

    /// Build `version` of the unit and install it in `units`
    fn install(&self, version: &str, units: &Path) {
        let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
        let target = self.dir.join("target");
        let output = Command::new(cargo)
            .arg("build")
            .arg("--offline")
            .arg("--manifest-path")
            .arg(self.dir.join("Cargo.toml"))
            .arg("--target-dir")
            .arg(&target)
            .env("COUNTER_UNIT_VERSION", version)
            .output()
            .expect("failed to run cargo");
        assert!(
            output.status.success(),
            "unit build failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );

        let file_name = DylibLoader::library_file_name(UNIT);
        std::fs::copy(target.join("debug").join(&file_name), units.join(&file_name)).unwrap();
    }
}

#[tokio::test]
async fn test_library_reload_keeps_state_and_code_mapped() {
    let fixture = Fixture::new();
    let units = tempdir().unwrap();
    let shadows = tempdir().unwrap();
    fixture.install("v1", units.path());

    let loader = DylibLoader::new(units.path()).with_shadow_dir(shadows.path());
    let runtime = HmrRuntime::new(Arc::new(loader), None, RuntimeConfig::default());
    let mapped_before = resident_libraries();

    let cell = runtime.import(UNIT).await.unwrap();
    let first = cell.get_as::<String>().unwrap();
    assert_eq!(first.as_str(), "v1:v1-state");

    fixture.install("v2", units.path());
    runtime.reload(UNIT).await.unwrap();

    // State built by v1 is reused by v2 after v1's module is gone
    assert_eq!(cell.get_as::<String>().unwrap().as_str(), "v2:v1-state");
    assert_eq!(first.as_str(), "v1:v1-state");
    assert_eq!(resident_libraries(), mapped_before + 2);
    drop(first);

    runtime.unimport(UNIT).await;
    assert!(!runtime.is_imported(UNIT));
    assert_eq!(runtime.stats(), RuntimeStats::default());
    assert_eq!(cell.get_as::<String>().unwrap().as_str(), "v2:v1-state");

    #[cfg(unix)]
    assert_eq!(std::fs::read_dir(shadows.path()).unwrap().count(), 0);
}
