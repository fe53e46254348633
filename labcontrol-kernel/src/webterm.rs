/**
 * WEBTERM - `login_cmd` d'une carte lancé comme processus détaché suivi.
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::LabConfig;
use crate::error::{LabError, LabResult};
use crate::interpolate::Interpolator;
use crate::models::{format_timestamp, Board};
use crate::registry::{ProcessEntry, ProcessRegistry};
use crate::reservation::ReleaseHook;
use crate::runner::{is_alive, ProcessRunner};

pub struct WebtermManager {
    runner: Arc<ProcessRunner>,
    registry: ProcessRegistry,
    clock: Arc<dyn Clock>,
    interpolator: Interpolator,
}

fn key(board: &str) -> String {
    format!("webterm-{board}")
}

impl WebtermManager {
    pub fn new(config: &LabConfig, runner: Arc<ProcessRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            runner,
            registry: ProcessRegistry::new(config.process_registry_path()),
            clock,
            interpolator: Interpolator::new(config.max_interpolation_passes),
        }
    }

    pub async fn status(&self, board: &str) -> LabResult<Option<ProcessEntry>> {
        Ok(self
            .registry
            .get(&key(board))
            .await?
            .filter(|entry| is_alive(entry.pid)))
    }

    pub async fn open(&self, board: &Board) -> LabResult<ProcessEntry> {
        let key = key(board.name());
        if let Some(existing) = self.registry.get(&key).await? {
            if is_alive(existing.pid) {
                return Err(LabError::Conflict(format!(
                    "a web terminal is already open for board '{}' (pid {})",
                    board.name(),
                    existing.pid
                )));
            }
            info!(board = board.name(), pid = existing.pid, "replacing stale web terminal entry");
            self.runner.cleanup(&key);
        }

        let template = board.template("login_cmd")?;
        let cmd = self
            .interpolator
            .command(template, &[&board.attrs()], &HashMap::new())?;
        let pid = self.runner.run_async(&key, &cmd, None).await?;
        let entry = ProcessEntry {
            pid,
            command: cmd.to_string(),
            started: format_timestamp(self.clock.now()),
        };
        self.registry.insert(&key, entry.clone()).await?;
        info!(board = board.name(), pid, "web terminal opened");
        Ok(entry)
    }

    pub async fn close(&self, board: &str) -> LabResult<ProcessEntry> {
        let key = key(board);
        let entry = self
            .registry
            .get(&key)
            .await?
            .ok_or_else(|| LabError::not_found("web terminal", board))?;
        self.runner.kill(entry.pid).await?;
        self.registry.remove(&key).await?;
        self.runner.cleanup(&key);
        info!(board, pid = entry.pid, "web terminal closed");
        Ok(entry)
    }
}

#[async_trait]
impl ReleaseHook for WebtermManager {
    async fn released(&self, board: &str) {
        match self.close(board).await {
            Ok(_) | Err(LabError::NotFound { .. }) => {}
            Err(e) => warn!(board, error = %e, "could not close web terminal on release"),
        }
    }
}
