use async_trait::async_trait;
use serde_json::json;

use super::{Action, ActionOutput, ActionRequest};
use crate::error::{LabError, LabResult};
use crate::lab::Lab;
use crate::models::{Board, ASSIGNED_TO, END_TIME, START_TIME};
use crate::reservation::ReservationLength;

pub struct AssignBoard;
pub struct ReleaseBoard;

fn reservation_json(board: &Board) -> serde_json::Value {
    let record = board.record();
    json!({
        "board": board.name(),
        ASSIGNED_TO: record.get_str(ASSIGNED_TO),
        START_TIME: record.get_str(START_TIME),
        END_TIME: record.get_str(END_TIME),
    })
}

#[async_trait]
impl Action for AssignBoard {
    fn name(&self) -> &'static str {
        "assign_board"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let length = match request.get("duration") {
            Some(d) => ReservationLength::parse(d)?,
            None => ReservationLength::parse(&lab.config.default_reservation_minutes.to_string())?,
        };
        let board = lab
            .reservations
            .assign(request.require_target()?, &request.identity, length)?;
        Ok(ActionOutput::Json(reservation_json(&board)))
    }
}

#[async_trait]
impl Action for ReleaseBoard {
    fn name(&self) -> &'static str {
        "release_board"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let name = request.require_target()?;
        let force = request.flag("force");
        if force && !request.identity.is_admin() {
            let board = lab.reservations.get_board(name)?;
            return Err(LabError::Authorization {
                board: name.to_string(),
                holder: board.reservation().assignee.to_string(),
                operation: "force a release without admin rights".into(),
            });
        }
        let board = lab.reservations.release(name, &request.identity, force).await?;
        Ok(ActionOutput::Json(reservation_json(&board)))
    }
}
