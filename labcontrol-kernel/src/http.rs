/**
 * API HTTP LABCONTROL - Adaptateur REST au-dessus du registre d'actions
 *
 * RÔLE :
 * Ce module expose les opérations du kernel (réservations, alimentation,
 * exécution, captures, webterms) sous forme de routes Axum.
 *
 * FONCTIONNEMENT :
 * - Middleware d'identification : token `Authorization` ou cookie `auth_token`
 * - Routes : /health, /api/devices, /api/devices/{board}/{action}, /api/resources
 * - Réponses `{"result":"OK","data":..}` ou `{"result":"FAIL","kind":..,"message":..}`
 * - Les charges binaires (téléchargements, vidéo) partent brutes en octet-stream
 *
 * UTILITÉ DANS LABCONTROL :
 * 🎯 Interface unique des clients CLI et web
 * 🎯 Codes HTTP dérivés du `kind` de l'erreur (404, 401, 403, 409, 422, 502, 504)
 */

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::actions::{ActionOutput, ActionRegistry, ActionRequest};
use crate::error::{LabError, LabResult};
use crate::lab::Lab;
use crate::models::Identity;

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub lab: Arc<Lab>,
    pub actions: Arc<ActionRegistry>,
}

impl AppState {
    pub fn new(lab: Lab) -> Self {
        Self {
            lab: Arc::new(lab),
            actions: Arc::new(ActionRegistry::standard()),
        }
    }
}

fn status_for(err: &LabError) -> StatusCode {
    match err {
        LabError::NotFound { .. } => StatusCode::NOT_FOUND,
        LabError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
        LabError::Authorization { .. } => StatusCode::FORBIDDEN,
        LabError::Conflict(_) => StatusCode::CONFLICT,
        LabError::InvalidInput { .. } | LabError::Template(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LabError::Execution { .. } => StatusCode::BAD_GATEWAY,
        LabError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        LabError::ProcessControl { .. }
        | LabError::Config(_)
        | LabError::Io { .. }
        | LabError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Action result rendered as an HTTP response
pub struct Reply(pub LabResult<ActionOutput>);

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let output = match self.0 {
            Ok(output) => output,
            Err(err) => {
                let body = json!({
                    "result": "FAIL",
                    "kind": err.kind(),
                    "message": err.to_string(),
                });
                return (status_for(&err), Json(body)).into_response();
            }
        };
        let data = match output {
            ActionOutput::Empty => Value::Null,
            ActionOutput::Text(text) => Value::String(text),
            ActionOutput::Json(value) => value,
            ActionOutput::Bytes { file_name, data } => {
                let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
                    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
                return (
                    [
                        (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
                        (header::CONTENT_DISPOSITION, disposition),
                    ],
                    data,
                )
                    .into_response();
            }
        };
        Json(json!({"result": "OK", "data": data})).into_response()
    }
}

async fn resolve_identity(State(app): State<AppState>, mut req: Request, next: Next) -> Response {
    let identity = app.lab.auth.identify(req.headers());
    req.extensions_mut().insert(identity);
    next.run(req).await
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/devices", get(list_boards))
        .route("/api/devices/{board}", get(get_board))
        .route(
            "/api/devices/{board}/{action}",
            get(board_action).post(board_action),
        )
        .route("/api/resources", get(list_resources))
        .route("/api/resources/{resource}", get(get_resource))
        .layer(middleware::from_fn_with_state(app_state.clone(), resolve_identity))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(app_state)
}

async fn dispatch(app: &AppState, action: &str, request: ActionRequest) -> Reply {
    Reply(app.actions.dispatch(&app.lab, action, &request).await)
}

// GET /api/devices
async fn list_boards(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    let request = ActionRequest {
        identity,
        params,
        ..Default::default()
    };
    dispatch(&app, "list_boards", request).await
}

// GET /api/devices/{board}
async fn get_board(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(board): Path<String>,
) -> Reply {
    dispatch(&app, "get_board", ActionRequest::new(identity).target(board)).await
}

// GET|POST /api/devices/{board}/{action}
async fn board_action(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((board, action)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Reply {
    let request = ActionRequest {
        identity,
        target: Some(board),
        params,
        body: (!body.is_empty()).then(|| body.to_vec()),
    };
    dispatch(&app, &action, request).await
}

// GET /api/resources
async fn list_resources(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    let request = ActionRequest {
        identity,
        params,
        ..Default::default()
    };
    dispatch(&app, "list_resources", request).await
}

// GET /api/resources/{resource}
async fn get_resource(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(resource): Path<String>,
) -> Reply {
    dispatch(&app, "get_resource", ActionRequest::new(identity).target(resource)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_for(&LabError::not_found("board", "x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&LabError::Conflict("busy".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&LabError::Timeout {
                command: "sleep 30".into(),
                seconds: 10
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&LabError::invalid("dest", "bad")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
