/**
 * ACTIONS - Registre explicite nom -> handler, appelé par la couche HTTP
 *
 * RÔLE : Une opération de carte ou de ressource par action nommée.
 * FONCTIONNEMENT : `ActionOutput` ou `LabError` ; un nom inconnu est `NotFound`.
 */

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{LabError, LabResult};
use crate::gate;
use crate::lab::Lab;
use crate::models::{Board, Identity};

mod capture;
mod exec;
mod objects;
mod power;
mod reservation;
mod webterm;

#[derive(Debug, Clone, Default)]
pub struct ActionRequest {
    pub identity: Identity,
    /// Board name for board-scoped actions, record name for lookups
    pub target: Option<String>,
    pub params: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl ActionRequest {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> LabResult<&str> {
        self.get(key)
            .ok_or_else(|| LabError::invalid(key, "missing parameter"))
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(str::to_ascii_lowercase).as_deref(),
            Some("true" | "1" | "yes")
        )
    }

    pub fn require_target(&self) -> LabResult<&str> {
        self.target
            .as_deref()
            .ok_or_else(|| LabError::invalid("target", "this action needs a board or resource name"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    Empty,
    Text(String),
    Json(Value),
    Bytes { file_name: String, data: Vec<u8> },
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput>;
}

/// Loads the target board (expiring it if needed) and checks the caller holds it
pub(crate) fn reserved_board(lab: &Lab, request: &ActionRequest, operation: &str) -> LabResult<Board> {
    let board = lab.reservations.get_board(request.require_target()?)?;
    gate::require_reserved_by(&board, &request.identity, operation)?;
    Ok(board)
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.insert(action.name(), action);
        self
    }

    /// Every built-in action
    pub fn standard() -> Self {
        Self::new()
            .register(Arc::new(objects::ListBoards))
            .register(Arc::new(objects::GetBoard))
            .register(Arc::new(objects::ListResources))
            .register(Arc::new(objects::GetResource))
            .register(Arc::new(reservation::AssignBoard))
            .register(Arc::new(reservation::ReleaseBoard))
            .register(Arc::new(power::Power))
            .register(Arc::new(power::Status))
            .register(Arc::new(exec::Run))
            .register(Arc::new(exec::Upload))
            .register(Arc::new(exec::Download))
            .register(Arc::new(capture::StartCapture))
            .register(Arc::new(capture::StopCapture))
            .register(Arc::new(capture::GetCaptureData))
            .register(Arc::new(capture::GetCaptureRef))
            .register(Arc::new(capture::DeleteCapture))
            .register(Arc::new(capture::ListCaptures))
            .register(Arc::new(webterm::OpenWebterm))
            .register(Arc::new(webterm::CloseWebterm))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actions.keys().copied().collect()
    }

    pub async fn dispatch(&self, lab: &Lab, name: &str, request: &ActionRequest) -> LabResult<ActionOutput> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| LabError::not_found("action", name))?;
        debug!(action = name, target = ?request.target, user = ?request.identity.name(), "dispatching action");
        let result = action.handle(lab, request).await;
        if let Err(e) = &result {
            info!(action = name, target = ?request.target, kind = e.kind(), error = %e, "action failed");
        }
        result
    }
}
