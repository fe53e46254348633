/**
 * CAPTURE SESSIONS - Enregistrement de données depuis une ressource du labo
 *
 * RÔLE :
 * Démarre, arrête, lit et supprime les captures (série, caméra, mesure de
 * puissance) d'une ressource.
 *
 * FONCTIONNEMENT :
 * - Une session n'existe que sous forme de fichiers :
 *   `<run>/<ressource>-<token>.pid` pendant l'exécution,
 *   `<captures>/<ressource>-<token>.<ext>` pour les données
 * - Token horodaté au centième, suffixe `-N` en cas de collision
 * - Rien n'est stocké dans l'object store, aucun lien avec les réservations
 *
 * UTILITÉ DANS LABCONTROL :
 * 🎯 Journaux série et mesures de consommation pendant les tests de cartes
 * 🎯 Vidéo de la carte renvoyée brute, CSV renvoyé en enregistrements JSON
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::LabConfig;
use crate::error::{LabError, LabResult};
use crate::interpolate::Interpolator;
use crate::models::Resource;
use crate::runner::{is_alive, ProcessRunner};
use crate::store::validate_name;

mod format;

pub use format::{formatter_for, CsvRecords, DataFormatter, RawText};

const TOKEN_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]_[hour].[minute].[second].[subsecond digits:2]"
);

const TEXT_EXTENSION: &str = "txt";
const VIDEO_KINDS: &[&str] = &["video", "camera"];
const MAX_TOKEN_SUFFIX: u32 = 1000;

pub fn format_token(now: OffsetDateTime) -> String {
    now.format(TOKEN_FORMAT)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// Selects `capture_<kind>_cmd`, falling back to `capture_cmd`
    pub kind: Option<String>,
    /// Seconds; 0 means until stopped
    pub duration: Option<u64>,
    /// Caller-supplied values, bound after the template is split into arguments
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub resource: String,
    pub token: String,
    pub pid: i32,
    pub data_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Non-empty stderr of the stopped process
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapturePayload {
    Formatted(serde_json::Value),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    pub token: String,
    pub running: bool,
    pub data_file: Option<String>,
}

pub struct CaptureManager {
    config: Arc<LabConfig>,
    runner: Arc<ProcessRunner>,
    clock: Arc<dyn Clock>,
    interpolator: Interpolator,
}

impl CaptureManager {
    pub fn new(config: Arc<LabConfig>, runner: Arc<ProcessRunner>, clock: Arc<dyn Clock>) -> Self {
        let interpolator = Interpolator::new(config.max_interpolation_passes);
        Self {
            config,
            runner,
            clock,
            interpolator,
        }
    }

    fn key(resource: &str, token: &str) -> String {
        format!("{resource}-{token}")
    }

    fn is_video(resource: &Resource, kind: Option<&str>) -> bool {
        match kind {
            Some(k) => VIDEO_KINDS.contains(&k),
            None => resource.has_type("camera"),
        }
    }

    fn template<'a>(resource: &'a Resource, kind: Option<&str>) -> LabResult<&'a str> {
        if let Some(kind) = kind {
            let specific = format!("capture_{kind}_cmd");
            if resource.has_template(&specific) {
                return resource.template(&specific);
            }
        }
        resource.template("capture_cmd")
    }

    /// Data file of a session: named by its PID file if present, otherwise found
    /// in the capture directory by `<resource>-<token>.<ext>`
    fn data_file(&self, key: &str) -> LabResult<Option<PathBuf>> {
        if let Some(pid_file) = self.runner.read_pid_file(key)? {
            if let Some(path) = pid_file.data_path.filter(|p| p.is_file()) {
                return Ok(Some(path));
            }
        }
        let dir = self.config.capture_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LabError::io(&dir, e)),
        };
        let prefix = format!("{key}.");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(ext) = name.strip_prefix(&prefix) {
                if !ext.is_empty() && !ext.contains('.') {
                    return Ok(Some(entry.path()));
                }
            }
        }
        Ok(None)
    }

    fn running_pid(&self, key: &str) -> LabResult<Option<i32>> {
        Ok(self
            .runner
            .read_pid_file(key)?
            .map(|p| p.pid)
            .filter(|pid| is_alive(*pid)))
    }

    /// Timestamp token, suffixed `-N` while a PID or data file already uses it.
    /// The returned token's PID file is claimed; the caller owns its cleanup.
    fn new_token(&self, resource: &str) -> LabResult<String> {
        let base = format_token(self.clock.now());
        for n in 0..MAX_TOKEN_SUFFIX {
            let candidate = if n == 0 {
                base.clone()
            } else {
                format!("{base}-{n}")
            };
            let key = Self::key(resource, &candidate);
            if self.data_file(&key)?.is_some() {
                continue;
            }
            if self.runner.claim(&key)? {
                return Ok(candidate);
            }
        }
        Err(LabError::Conflict(format!(
            "no free capture token for resource '{resource}' at {base}"
        )))
    }

    pub async fn start(&self, resource: &Resource, request: CaptureRequest) -> LabResult<CaptureSession> {
        let name = resource.name();
        let kind = request.kind.as_deref();
        if let Some(kind) = kind {
            validate_name("kind", kind)?;
        }
        let template = Self::template(resource, kind)?;

        let attrs = resource.attrs();
        for key in request.extra.keys() {
            validate_name("parameter", key)?;
            if attrs.contains_key(key) || matches!(key.as_str(), "logfile" | "output" | "duration" | "token") {
                return Err(LabError::invalid(key, "cannot override a configured variable"));
            }
        }

        let token = self.new_token(name)?;
        let key = Self::key(name, &token);
        match self.launch(resource, &request, template, &token, &key).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.runner.cleanup(&key);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        resource: &Resource,
        request: &CaptureRequest,
        template: &str,
        token: &str,
        key: &str,
    ) -> LabResult<CaptureSession> {
        let name = resource.name();
        let kind = request.kind.as_deref();
        let attrs = resource.attrs();
        let extension = if Self::is_video(resource, kind) {
            self.config.video_extension.as_str()
        } else {
            TEXT_EXTENSION
        };
        let capture_dir = self.config.capture_dir();
        tokio::fs::create_dir_all(&capture_dir)
            .await
            .map_err(|e| LabError::io(&capture_dir, e))?;
        let data_path = capture_dir.join(format!("{key}.{extension}"));
        let data = data_path.to_string_lossy().into_owned();

        let duration = request
            .duration
            .unwrap_or(self.config.default_capture_duration_secs);
        let server_vars = HashMap::from([
            ("logfile".to_string(), data.clone()),
            ("output".to_string(), data),
            ("duration".to_string(), duration.to_string()),
            ("token".to_string(), token.to_string()),
        ]);
        let cmd = self
            .interpolator
            .command(template, &[&attrs, &server_vars], &request.extra)?;

        let pid = self.runner.run_async(key, &cmd, Some(&data_path)).await?;
        info!(resource = name, token = %token, pid, kind = kind.unwrap_or("default"), "capture started");
        Ok(CaptureSession {
            resource: name.to_string(),
            token: token.to_string(),
            pid,
            data_path,
        })
    }

    /// Kills the capture process and removes its PID and transient output files;
    /// the data file is kept
    pub async fn stop(&self, resource: &Resource, token: &str) -> LabResult<StopReport> {
        validate_name("token", token)?;
        let key = Self::key(resource.name(), token);
        let pid_file = self.runner.read_pid_file(&key)?.ok_or_else(|| {
            LabError::not_found("running capture", format!("{}/{token}", resource.name()))
        })?;

        self.runner.kill(pid_file.pid).await?;

        let stderr = std::fs::read(self.runner.stderr_path(&key))
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())
            .unwrap_or_default();
        self.runner.cleanup(&key);
        info!(resource = resource.name(), token, pid = pid_file.pid, "capture stopped");

        if stderr.is_empty() {
            return Ok(StopReport { warning: None });
        }
        warn!(resource = resource.name(), token, stderr = %stderr, "capture process reported errors");
        Ok(StopReport {
            warning: Some(stderr),
        })
    }

    fn existing_data_file(&self, resource: &Resource, token: &str) -> LabResult<PathBuf> {
        validate_name("token", token)?;
        let key = Self::key(resource.name(), token);
        self.data_file(&key)?.ok_or_else(|| {
            LabError::not_found("capture data", format!("{}/{token}", resource.name()))
        })
    }

    pub async fn get_data(&self, resource: &Resource, token: &str) -> LabResult<CapturePayload> {
        let path = self.existing_data_file(resource, token)?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| LabError::io(&path, e))?;
        if has_extension(&path, &self.config.video_extension) {
            return Ok(CapturePayload::Raw(raw));
        }
        Ok(CapturePayload::Formatted(formatter_for(resource).format(&raw)))
    }

    /// URL of the data file, refused while the capture is still running
    pub fn get_data_ref(&self, resource: &Resource, token: &str) -> LabResult<String> {
        validate_name("token", token)?;
        let key = Self::key(resource.name(), token);
        if let Some(pid) = self.running_pid(&key)? {
            return Err(LabError::Conflict(format!(
                "capture '{token}' on resource '{}' is still running (pid {pid})",
                resource.name()
            )));
        }
        let path = self.existing_data_file(resource, token)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LabError::invalid("token", "data file name is not UTF-8"))?;
        Ok(self.config.capture_url(file_name))
    }

    pub async fn delete(&self, resource: &Resource, token: &str) -> LabResult<()> {
        let key = Self::key(resource.name(), token);
        let path = self.existing_data_file(resource, token)?;
        if self.running_pid(&key)?.is_some() {
            return Err(LabError::Conflict(format!(
                "capture '{token}' on resource '{}' is still running, stop it first",
                resource.name()
            )));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| LabError::io(&path, e))?;
        info!(resource = resource.name(), token, "capture data deleted");
        Ok(())
    }

    /// Sessions of a resource known from PID files and data files
    pub fn list(&self, resource: &Resource) -> LabResult<Vec<CaptureStatus>> {
        let prefix = format!("{}-", resource.name());
        let mut tokens: Vec<String> = Vec::new();
        for dir in [self.config.run_dir(), self.config.capture_dir()] {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(rest) = name.strip_prefix(&prefix) else { continue };
                let Some((token, _ext)) = rest.rsplit_once('.') else { continue };
                if token_shaped(token) && !tokens.iter().any(|t| t == token) {
                    tokens.push(token.to_string());
                }
            }
        }
        tokens.sort();

        tokens
            .into_iter()
            .map(|token| {
                let key = Self::key(resource.name(), &token);
                let running = self.running_pid(&key)?.is_some();
                let data_file = self
                    .data_file(&key)?
                    .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(String::from));
                Ok(CaptureStatus {
                    token,
                    running,
                    data_file,
                })
            })
            .collect()
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// `YYYY-MM-DD_HH.MM.SS.cc` with an optional `-N` suffix
fn token_shaped(s: &str) -> bool {
    let base = match s.get(22..) {
        None | Some("") => s,
        Some(rest) => match rest.strip_prefix('-') {
            Some(n) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => &s[..22],
            _ => return false,
        },
    };
    base.len() == 22 && base.as_bytes()[10] == b'_'
}
