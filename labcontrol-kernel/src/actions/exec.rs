use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{reserved_board, Action, ActionOutput, ActionRequest};
use crate::capture::format_token;
use crate::error::{LabError, LabResult};
use crate::interpolate::validate_path_value;
use crate::lab::Lab;

pub struct Run;
pub struct Upload;
pub struct Download;

fn user_arg(key: &str, value: &str) -> HashMap<String, String> {
    HashMap::from([(key.to_string(), value.to_string())])
}

fn server_var(key: &str, path: &Path) -> HashMap<String, String> {
    HashMap::from([(key.to_string(), path.to_string_lossy().into_owned())])
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').find(|p| !p.is_empty()).unwrap_or("file")
}

/// Fresh path in the upload staging directory for one transfer
async fn staging_path(lab: &Lab, board: &str, file_name: &str) -> LabResult<PathBuf> {
    let dir = lab.config.upload_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| LabError::io(&dir, e))?;
    let token = format_token(lab.clock.now());
    Ok(dir.join(format!("{board}-{token}-{file_name}")))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove staged file");
        }
    }
}

#[async_trait]
impl Action for Run {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = reserved_board(lab, request, "run commands")?;
        let command = request.require("command")?;
        let res = lab
            .run_board_command(
                &board,
                "run_cmd",
                &HashMap::new(),
                &user_arg("command", command),
                lab.config.long_timeout(),
            )
            .await?
            .into_result()?;
        Ok(ActionOutput::Text(res.stdout))
    }
}

#[async_trait]
impl Action for Upload {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = reserved_board(lab, request, "upload files")?;
        let dest = request.require("dest")?;
        validate_path_value("dest", dest)?;
        let body = request
            .body
            .as_deref()
            .ok_or_else(|| LabError::invalid("body", "upload needs file content"))?;

        let staged = staging_path(lab, board.name(), base_name(dest)).await?;
        tokio::fs::write(&staged, body)
            .await
            .map_err(|e| LabError::io(&staged, e))?;

        let result = lab
            .run_board_command(
                &board,
                "upload_cmd",
                &server_var("src", &staged),
                &user_arg("dest", dest),
                lab.config.long_timeout(),
            )
            .await
            .and_then(|r| r.into_result());
        discard(&staged).await;
        result?;

        info!(board = board.name(), dest, bytes = body.len(), "file uploaded");
        Ok(ActionOutput::Text(format!("uploaded {} bytes to {dest}", body.len())))
    }
}

#[async_trait]
impl Action for Download {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn handle(&self, lab: &Lab, request: &ActionRequest) -> LabResult<ActionOutput> {
        let board = reserved_board(lab, request, "download files")?;
        let src = request.require("src")?;
        validate_path_value("src", src)?;
        let file_name = base_name(src).to_string();

        let staged = staging_path(lab, board.name(), &file_name).await?;
        let result = lab
            .run_board_command(
                &board,
                "download_cmd",
                &server_var("dest", &staged),
                &user_arg("src", src),
                lab.config.long_timeout(),
            )
            .await
            .and_then(|r| r.into_result());
        if let Err(e) = result {
            discard(&staged).await;
            return Err(e);
        }

        let data = tokio::fs::read(&staged).await.map_err(|e| LabError::io(&staged, e));
        discard(&staged).await;
        let data = data?;
        info!(board = board.name(), src, bytes = data.len(), "file downloaded");
        Ok(ActionOutput::Bytes { file_name, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_names() {
        assert_eq!(base_name("/root/fw.bin"), "fw.bin");
        assert_eq!(base_name("logs/"), "logs");
        assert_eq!(base_name("/"), "file");
    }
}
