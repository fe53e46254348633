use async_trait::async_trait;
use serde_json::json;

use super::{reserved_board, Action, ActionOutput, ActionRequest};
use crate::error::LabResult;
use crate::lab::Lab;

pub struct OpenWebterm;
pub struct CloseWebterm;

#[async_trait]
impl Action for OpenWebterm {
    fn name(&self) -> &'static str {
        "open_webterm"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = reserved_board(lab, request, "open a web terminal")?;
        let entry = lab.webterms.open(&board).await?;
        Ok(ActionOutput::Json(json!({
            "board": board.name(),
            "pid": entry.pid,
            "started": entry.started,
        })))
    }
}

#[async_trait]
impl Action for CloseWebterm {
    fn name(&self) -> &'static str {
        "close_webterm"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = reserved_board(lab, request, "close the web terminal")?;
        lab.webterms.close(board.name()).await?;
        Ok(ActionOutput::Empty)
    }
}
