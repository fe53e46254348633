use async_trait::async_trait;
use serde_json::json;

use super::{reserved_board, Action, ActionOutput, ActionRequest};
use crate::capture::{CapturePayload, CaptureRequest};
use crate::error::{LabError, LabResult};
use crate::lab::Lab;
use crate::models::{BoardRole, Resource};

pub struct StartCapture;
pub struct StopCapture;
pub struct GetCaptureData;
pub struct GetCaptureRef;
pub struct DeleteCapture;
pub struct ListCaptures;

const RESERVED_PARAMS: &[&str] = &["feature", "kind", "duration", "token", "action"];

/// Gate on the board, then resolve the resource filling `feature`
fn feature_resource(lab: &Lab, request: &ActionRequest, operation: &str) -> LabResult<Resource> {
    let board = reserved_board(lab, request, operation)?;
    let role = BoardRole::parse(request.require("feature")?)?;
    lab.board_resource(&board, role)
}

#[async_trait]
impl Action for StartCapture {
    fn name(&self) -> &'static str {
        "start_capture"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "start a capture")?;
        let duration = request
            .get("duration")
            .map(|d| {
                d.parse::<u64>()
                    .map_err(|_| LabError::invalid("duration", format!("'{d}' is not a number of seconds")))
            })
            .transpose()?;
        let extra = request
            .params
            .iter()
            .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let session = lab
            .captures
            .start(
                &resource,
                CaptureRequest {
                    kind: request.get("kind").map(String::from),
                    duration,
                    extra,
                },
            )
            .await?;
        Ok(ActionOutput::Json(json!({
            "resource": session.resource,
            "token": session.token,
            "pid": session.pid,
        })))
    }
}

#[async_trait]
impl Action for StopCapture {
    fn name(&self) -> &'static str {
        "stop_capture"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "stop a capture")?;
        let token = request.require("token")?;
        let report = lab.captures.stop(&resource, token).await?;
        Ok(ActionOutput::Json(json!({
            "token": token,
            "warning": report.warning,
        })))
    }
}

#[async_trait]
impl Action for GetCaptureData {
    fn name(&self) -> &'static str {
        "get_capture_data"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "read capture data")?;
        let token = request.require("token")?;
        match lab.captures.get_data(&resource, token).await? {
            CapturePayload::Formatted(value) => Ok(ActionOutput::Json(value)),
            CapturePayload::Raw(data) => Ok(ActionOutput::Bytes {
                file_name: format!("{}-{token}.{}", resource.name(), lab.config.video_extension),
                data,
            }),
        }
    }
}

#[async_trait]
impl Action for GetCaptureRef {
    fn name(&self) -> &'static str {
        "get_capture_ref"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "read capture data")?;
        let url = lab.captures.get_data_ref(&resource, request.require("token")?)?;
        Ok(ActionOutput::Text(url))
    }
}

#[async_trait]
impl Action for DeleteCapture {
    fn name(&self) -> &'static str {
        "delete_capture"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "delete capture data")?;
        lab.captures.delete(&resource, request.require("token")?).await?;
        Ok(ActionOutput::Empty)
    }
}

#[async_trait]
impl Action for ListCaptures {
    fn name(&self) -> &'static str {
        "list_captures"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = feature_resource(lab, request, "list captures")?;
        let sessions: Vec<_> = lab
            .captures
            .list(&resource)?
            .into_iter()
            .map(|s| json!({"token": s.token, "running": s.running, "data_file": s.data_file}))
            .collect();
        Ok(ActionOutput::Json(json!(sessions)))
    }
}
