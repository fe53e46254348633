use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{LabError, LabResult};

/// Candidate installation roots, first existing one wins
const BASE_DIR_CANDIDATES: &[&str] = &["/usr/local/lib/labcontrol/lc-data", "./lc-data"];

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LabConfig {
    pub base_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub files_dir: Option<PathBuf>,
    pub utils_dir: Option<PathBuf>,
    pub files_url_base: String,
    pub listen_addr: String,
    pub short_timeout_secs: u64,
    pub long_timeout_secs: u64,
    pub reboot_delay_secs: u64,
    pub video_extension: String,
    pub default_reservation_minutes: u64,
    pub default_capture_duration_secs: u64,
    pub max_interpolation_passes: usize,
    pub kill_retries: u32,
    pub kill_backoff_ms: u64,
}

impl Default for LabConfig {
    fn default() -> Self {
        let base_dir = BASE_DIR_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("./lc-data"));
        Self::with_base_dir(base_dir)
    }
}

impl LabConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            data_dir: None,
            files_dir: None,
            utils_dir: None,
            files_url_base: "/lc-data".into(),
            listen_addr: "0.0.0.0:8000".into(),
            short_timeout_secs: 10,
            long_timeout_secs: 300,
            reboot_delay_secs: 2,
            video_extension: "mp4".into(),
            default_reservation_minutes: 60,
            default_capture_duration_secs: 0,
            max_interpolation_passes: 10,
            kill_retries: 5,
            kill_backoff_ms: 100,
        }
    }

    /// JSON records (boards, resources, users, process registry)
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| self.base_dir.join("data"))
    }

    pub fn files_dir(&self) -> PathBuf {
        self.files_dir.clone().unwrap_or_else(|| self.base_dir.join("files"))
    }

    /// Helper scripts that templates may name without a path
    pub fn utils_dir(&self) -> PathBuf {
        self.utils_dir.clone().unwrap_or_else(|| self.base_dir.join("utils"))
    }

    /// PID files and transient stdout/stderr of detached processes
    pub fn run_dir(&self) -> PathBuf {
        self.files_dir().join("run")
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.files_dir().join("captures")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.files_dir().join("uploads")
    }

    pub fn process_registry_path(&self) -> PathBuf {
        self.data_dir().join("process-registry.json")
    }

    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.short_timeout_secs)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.long_timeout_secs)
    }

    /// URL under which capture data files are served
    pub fn capture_url(&self, file_name: &str) -> String {
        format!(
            "{}/captures/{}",
            self.files_url_base.trim_end_matches('/'),
            file_name
        )
    }

    /// Creates every directory the kernel writes into
    pub async fn ensure_dirs(&self) -> LabResult<()> {
        let data = self.data_dir();
        let dirs = [
            data.join("boards"),
            data.join("resources"),
            data.join("users"),
            self.run_dir(),
            self.capture_dir(),
            self.upload_dir(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| LabError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Loads the configuration named by `LABCONTROL_CONFIG` (default `lcserver.yaml`)
pub async fn load_config() -> LabResult<LabConfig> {
    let path = std::env::var("LABCONTROL_CONFIG").unwrap_or_else(|_| "lcserver.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> LabResult<LabConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "no configuration file, using defaults");
        return Ok(LabConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|e| LabError::io(path, e))?;
    if txt.trim().is_empty() {
        return Ok(LabConfig::default());
    }
    let cfg: LabConfig = serde_yaml::from_str(&txt)
        .map_err(|e| LabError::Config(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), base_dir = %cfg.base_dir.display(), "configuration loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_directories_follow_base_dir() {
        let cfg = LabConfig::with_base_dir("/srv/lab");
        assert_eq!(cfg.data_dir(), PathBuf::from("/srv/lab/data"));
        assert_eq!(cfg.run_dir(), PathBuf::from("/srv/lab/files/run"));
        assert_eq!(cfg.capture_dir(), PathBuf::from("/srv/lab/files/captures"));
        assert_eq!(cfg.utils_dir(), PathBuf::from("/srv/lab/utils"));
        assert_eq!(cfg.capture_url("a.txt"), "/lc-data/captures/a.txt");
    }

    #[tokio::test]
    async fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lcserver.yaml");
        std::fs::write(&path, "base_dir: /srv/lab\nshort_timeout_secs: 3\n").unwrap();

        let cfg = load_config_from(&path).await.unwrap();
        assert_eq!(cfg.base_dir, PathBuf::from("/srv/lab"));
        assert_eq!(cfg.short_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.long_timeout_secs, 300);
        assert_eq!(cfg.video_extension, "mp4");
    }

    #[tokio::test]
    async fn invalid_yaml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lcserver.yaml");
        std::fs::write(&path, "short_timeout_secs: [not a number\n").unwrap();

        let err = load_config_from(&path).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/lcserver.yaml"))
            .await
            .unwrap();
        assert_eq!(cfg.max_interpolation_passes, 10);
    }
}
