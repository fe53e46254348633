use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::info;

use super::{reserved_board, Action, ActionOutput, ActionRequest};
use crate::error::{LabError, LabResult};
use crate::lab::Lab;
use crate::models::BoardRole;

pub struct Power;
pub struct Status;

#[async_trait]
impl Action for Power {
    fn name(&self) -> &'static str {
        "power"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let op = request.require("op")?;
        let timeout = lab.config.short_timeout();

        if op == "status" {
            let board = lab.reservations.get_board(request.require_target()?)?;
            let pdu = lab.board_resource(&board, BoardRole::PowerController)?;
            let out = lab
                .run_resource_command(&board, &pdu, "status_cmd", timeout)
                .await?
                .into_result()?;
            return Ok(ActionOutput::Text(out.stdout.trim().to_string()));
        }

        if !matches!(op, "on" | "off" | "reboot") {
            return Err(LabError::invalid("op", format!("unsupported power operation '{op}'")));
        }
        let board = reserved_board(lab, request, &format!("power {op}"))?;
        let pdu = lab.board_resource(&board, BoardRole::PowerController)?;

        if op == "reboot" && !pdu.has_template("reboot_cmd") {
            lab.run_resource_command(&board, &pdu, "off_cmd", timeout)
                .await?
                .into_result()?;
            tokio::time::sleep(Duration::from_secs(lab.config.reboot_delay_secs)).await;
            lab.run_resource_command(&board, &pdu, "on_cmd", timeout)
                .await?
                .into_result()?;
        } else {
            lab.run_resource_command(&board, &pdu, &format!("{op}_cmd"), timeout)
                .await?
                .into_result()?;
        }
        info!(board = board.name(), controller = pdu.name(), op, "power operation done");
        Ok(ActionOutput::Empty)
    }
}

/// Board reachability via `network_status_cmd` and `command_status_cmd`
#[async_trait]
impl Action for Status {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = lab.reservations.get_board(request.require_target()?)?;
        let checks = [("network", "network_status_cmd"), ("command", "command_status_cmd")];
        let mut report = Map::new();

        for (label, key) in checks {
            if board.record().get_str(key).is_none() {
                continue;
            }
            let entry = match lab
                .run_board_command(&board, key, &Default::default(), &Default::default(), lab.config.short_timeout())
                .await
            {
                Ok(res) => json!({
                    "ok": res.success(),
                    "output": res.stdout.trim(),
                }),
                Err(e @ (LabError::Timeout { .. } | LabError::Execution { .. })) => json!({
                    "ok": false,
                    "output": e.to_string(),
                }),
                Err(e) => return Err(e),
            };
            report.insert(label.to_string(), entry);
        }

        if report.is_empty() {
            board.template("network_status_cmd")?;
        }
        Ok(ActionOutput::Json(Value::Object(report)))
    }
}
