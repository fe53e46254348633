/**
 * ERREURS - Taxonomie commune à tous les composants du kernel.
 * Chaque variante porte assez de contexte pour rendre un message seule.
 */

use std::path::PathBuf;

/// Failures raised while expanding a command template
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template references undefined variable '{0}'")]
    MissingKey(String),
    #[error("{owner} has no '{key}' attribute")]
    MissingTemplate { owner: String, key: String },
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    #[error("template still unresolved after {0} passes (self-referential variable?)")]
    TooDeep(usize),
    #[error("template could not be split into arguments: {0}")]
    Lex(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("board '{board}' is assigned to {holder}, cannot {operation}")]
    Authorization {
        board: String,
        holder: String,
        operation: String,
    },
    #[error("authentication required to {operation}")]
    Unauthenticated { operation: String },
    #[error("{0}")]
    Conflict(String),
    #[error("command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    Execution {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("process {pid} is still running after SIGKILL: {reason}")]
    ProcessControl { pid: i32, reason: String },
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LabError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        LabError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LabError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LabError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable identifier used in FAIL responses
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::NotFound { .. } => "not_found",
            LabError::Template(_) => "template",
            LabError::Authorization { .. } => "authorization",
            LabError::Unauthenticated { .. } => "unauthenticated",
            LabError::Conflict(_) => "conflict",
            LabError::Execution { .. } => "execution",
            LabError::Timeout { .. } => "timeout",
            LabError::ProcessControl { .. } => "process_control",
            LabError::InvalidInput { .. } => "invalid_input",
            LabError::Config(_) => "config",
            LabError::Io { .. } => "io",
            LabError::Json(_) => "json",
        }
    }
}

pub type LabResult<T> = Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_message_names_holder_and_operation() {
        let err = LabError::Authorization {
            board: "bbb".into(),
            holder: "alice".into(),
            operation: "power on".into(),
        };
        assert_eq!(
            err.to_string(),
            "board 'bbb' is assigned to alice, cannot power on"
        );
        assert_eq!(err.kind(), "authorization");
    }

    #[test]
    fn template_errors_convert() {
        let err: LabError = TemplateError::MissingKey("ip".into()).into();
        assert_eq!(err.kind(), "template");
        assert!(err.to_string().contains("'ip'"));
    }
}
