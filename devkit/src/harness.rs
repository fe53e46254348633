/*!
Test harness for the LabControl kernel

Sets up a complete lab in a temporary directory:
- file-backed object store and run/capture directories
- a manual clock so reservations can be fast-forwarded
- the standard action registry and the HTTP router
*/

use anyhow::Result;
use labcontrol_kernel::actions::{ActionOutput, ActionRegistry, ActionRequest};
use labcontrol_kernel::clock::ManualClock;
use labcontrol_kernel::config::LabConfig;
use labcontrol_kernel::http::{build_router, AppState};
use labcontrol_kernel::models::Identity;
use labcontrol_kernel::store::{FileStore, ObjectKind, ObjectStore, Record};
use labcontrol_kernel::{Lab, LabResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::macros::datetime;

/// Installs a test-friendly subscriber once per process
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labcontrol_kernel=debug".into()),
        )
        .try_init()
        .ok();
}

pub struct LabHarness {
    dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FileStore>,
    pub lab: Arc<Lab>,
    pub actions: Arc<ActionRegistry>,
}

impl LabHarness {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    /// Harness with configuration tweaks applied before the lab is built
    pub fn with_config(tweak: impl FnOnce(&mut LabConfig)) -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let mut config = LabConfig::with_base_dir(dir.path());
        config.short_timeout_secs = 5;
        config.long_timeout_secs = 10;
        config.reboot_delay_secs = 0;
        config.kill_backoff_ms = 20;
        tweak(&mut config);

        for sub in ["boards", "resources", "users"] {
            std::fs::create_dir_all(config.data_dir().join(sub))?;
        }
        for sub in [config.run_dir(), config.capture_dir(), config.upload_dir(), config.utils_dir()] {
            std::fs::create_dir_all(sub)?;
        }

        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 12:00 UTC)));
        let store = Arc::new(FileStore::new(config.data_dir()));
        let lab = Arc::new(Lab::new(config, store.clone(), clock.clone()));
        Ok(Self {
            dir,
            clock,
            store,
            lab,
            actions: Arc::new(ActionRegistry::standard()),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn utils_dir(&self) -> PathBuf {
        self.lab.config.utils_dir()
    }

    pub fn add_board(&self, record: Record) -> Result<()> {
        self.store.put(ObjectKind::Board, &record)?;
        Ok(())
    }

    pub fn add_resource(&self, record: Record) -> Result<()> {
        self.store.put(ObjectKind::Resource, &record)?;
        Ok(())
    }

    pub fn add_user(&self, record: Record) -> Result<()> {
        self.store.put(ObjectKind::User, &record)?;
        Ok(())
    }

    /// Board record as stored, without the expire-on-read pass
    pub fn stored_board(&self, name: &str) -> Result<Record> {
        Ok(self.store.get(ObjectKind::Board, name)?)
    }

    pub fn advance(&self, minutes: i64) {
        self.clock.advance(time::Duration::minutes(minutes));
    }

    pub fn request(&self, user: &str, board: &str) -> ActionRequest {
        ActionRequest::new(Identity::user(user)).target(board)
    }

    pub async fn dispatch(&self, action: &str, request: ActionRequest) -> LabResult<ActionOutput> {
        self.actions.dispatch(&self.lab, action, &request).await
    }

    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            lab: self.lab.clone(),
            actions: self.actions.clone(),
        })
    }
}

/// Polls until `path` exists and is non-empty
pub async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    wait_until(timeout, || {
        std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
    })
    .await
}

pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::BoardBuilder;

    #[tokio::test]
    async fn harness_builds_a_working_lab() {
        let h = LabHarness::new().unwrap();
        h.add_board(BoardBuilder::new("bbb").build()).unwrap();
        assert!(h.path().join("data/boards/board-bbb.json").is_file());

        let out = h
            .dispatch("list_boards", ActionRequest::default())
            .await
            .unwrap();
        assert_eq!(out, ActionOutput::Json(serde_json::json!(["bbb"])));
    }

    #[tokio::test]
    async fn wait_for_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!wait_for_file(&dir.path().join("never"), Duration::from_millis(100)).await);
    }
}
