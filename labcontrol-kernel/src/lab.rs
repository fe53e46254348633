/**
 * LAB - Kernel assemblé : configuration, store, horloge et gestionnaires.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::capture::CaptureManager;
use crate::clock::{Clock, SystemClock};
use crate::config::LabConfig;
use crate::error::{LabResult, TemplateError};
use crate::interpolate::Interpolator;
use crate::models::{Board, BoardRole, Resource};
use crate::reservation::ReservationManager;
use crate::runner::{ExecutionResult, ProcessRunner};
use crate::store::{validate_name, FileStore, ObjectKind, ObjectStore};
use crate::webterm::WebtermManager;

pub struct Lab {
    pub config: Arc<LabConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub runner: Arc<ProcessRunner>,
    pub interpolator: Interpolator,
    pub reservations: ReservationManager,
    pub captures: CaptureManager,
    pub webterms: Arc<WebtermManager>,
    pub auth: Authenticator,
}

impl Lab {
    pub fn new(config: LabConfig, store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let runner = Arc::new(ProcessRunner::new(&config));
        let webterms = Arc::new(WebtermManager::new(&config, runner.clone(), clock.clone()));
        let reservations =
            ReservationManager::new(store.clone(), clock.clone()).with_release_hook(webterms.clone());
        let captures = CaptureManager::new(config.clone(), runner.clone(), clock.clone());
        Self {
            interpolator: Interpolator::new(config.max_interpolation_passes),
            auth: Authenticator::new(store.clone()),
            config,
            store,
            clock,
            runner,
            reservations,
            captures,
            webterms,
        }
    }

    /// File-backed store under `data_dir` and the system clock
    pub fn from_config(config: LabConfig) -> Self {
        let store = Arc::new(FileStore::new(config.data_dir()));
        Self::new(config, store, Arc::new(SystemClock))
    }

    pub fn list_resources(&self, pattern: &str) -> LabResult<Vec<String>> {
        self.store.list_matching(ObjectKind::Resource, pattern)
    }

    pub fn get_resource(&self, name: &str) -> LabResult<Resource> {
        validate_name("resource", name)?;
        Ok(Resource::new(self.store.get(ObjectKind::Resource, name)?))
    }

    /// Resource referenced by `board` for `role`
    pub fn board_resource(&self, board: &Board, role: BoardRole) -> LabResult<Resource> {
        let name = board.role(role).ok_or_else(|| TemplateError::MissingTemplate {
            owner: format!("board '{}'", board.name()),
            key: role.field().to_string(),
        })?;
        self.get_resource(&name)
    }

    /// Runs a board template; `vars` are server-chosen, `user_args` are bound per argument
    pub async fn run_board_command(
        &self,
        board: &Board,
        key: &str,
        vars: &HashMap<String, String>,
        user_args: &HashMap<String, String>,
        timeout: Duration,
    ) -> LabResult<ExecutionResult> {
        let template = board.template(key)?;
        let cmd = self
            .interpolator
            .command(template, &[&board.attrs(), vars], user_args)?;
        self.runner.run_sync(&cmd, timeout).await
    }

    /// Runs a resource template with board attributes as the base variable set
    pub async fn run_resource_command(
        &self,
        board: &Board,
        resource: &Resource,
        key: &str,
        timeout: Duration,
    ) -> LabResult<ExecutionResult> {
        let template = resource.template(key)?;
        let cmd = self.interpolator.command(
            template,
            &[&board.attrs(), &resource.attrs()],
            &HashMap::new(),
        )?;
        self.runner.run_sync(&cmd, timeout).await
    }
}
