use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

use conveyor_core::{PipelineStore, SqlitePipelineStore};

const TENANT: &str = "9c1d2e3f-4a5b-4c6d-8e7f-a0b1c2d3e4f5";

/// Config with one bundled pipeline and the database in `dir`.
fn config_with_pipeline(dir: &Path) -> String {
    format!(
        r#"
[database]
path = "{}"

[monitor]
enabled = true
poll_interval_ms = 50

[[pipelines]]
tenant_id = "{}"
name = "ingest"
type = "import"
standard = true
processors = [{{ class_name = "fetch" }}]
"#,
        dir.join("conveyor.db").display(),
        TENANT
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// Spawn the daemon and return a handle
fn spawn_daemon(config_path: &Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_conveyor"))
        .env("CONVEYOR_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn daemon")
}

/// Wait until the daemon has installed the bundled pipeline
async fn wait_for_pipeline(db_path: &Path, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if db_path.exists() {
            if let Ok(store) = SqlitePipelineStore::new(db_path) {
                if store.exists(TENANT, "ingest").unwrap_or(false) {
                    return true;
                }
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_daemon_installs_configured_pipelines() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&config_with_pipeline(dir.path()));

    let mut daemon = spawn_daemon(config.path());

    assert!(
        wait_for_pipeline(&dir.path().join("conveyor.db"), 100).await,
        "Daemon did not install pipelines in time"
    );

    // Still running: it only exits on a signal.
    assert!(daemon.try_wait().unwrap().is_none());

    daemon.kill().await.unwrap();
}

#[tokio::test]
async fn test_daemon_exits_on_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&format!(
        r#"
[database]
path = "{}"
busy_timeout_ms = 0
"#,
        dir.path().join("conveyor.db").display()
    ));

    let mut daemon = spawn_daemon(config.path());
    let status = timeout(Duration::from_secs(10), daemon.wait())
        .await
        .expect("Daemon did not exit")
        .unwrap();

    assert!(!status.success());
}

#[tokio::test]
async fn test_daemon_exits_on_missing_config() {
    let dir = TempDir::new().unwrap();

    let mut daemon = spawn_daemon(&dir.path().join("missing.toml"));
    let status = timeout(Duration::from_secs(10), daemon.wait())
        .await
        .expect("Daemon did not exit")
        .unwrap();

    assert!(!status.success());
}
