use async_trait::async_trait;
use serde_json::json;

use super::{Action, ActionOutput, ActionRequest};
use crate::error::LabResult;
use crate::lab::Lab;

pub struct ListBoards;
pub struct GetBoard;
pub struct ListResources;
pub struct GetResource;

#[async_trait]
impl Action for ListBoards {
    fn name(&self) -> &'static str {
        "list_boards"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let names = lab.reservations.list_boards(request.get("name").unwrap_or("*"))?;
        Ok(ActionOutput::Json(json!(names)))
    }
}

#[async_trait]
impl Action for GetBoard {
    fn name(&self) -> &'static str {
        "get_board"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = lab.reservations.get_board(request.require_target()?)?;
        Ok(ActionOutput::Json(board.record().to_json()))
    }
}

#[async_trait]
impl Action for ListResources {
    fn name(&self) -> &'static str {
        "list_resources"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let names = lab.list_resources(request.get("name").unwrap_or("*"))?;
        Ok(ActionOutput::Json(json!(names)))
    }
}

#[async_trait]
impl Action for GetResource {
    fn name(&self) -> &'static str {
        "get_resource"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let resource = lab.get_resource(request.require_target()?)?;
        Ok(ActionOutput::Json(resource.record().to_json()))
    }
}
