use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to determine current directory")]
    CurrentDir(#[source] std::io::Error),

    #[error("state directory '{path}' is a file")]
    StateDirIsFile { path: PathBuf },

    #[error("state store error")]
    Store(#[from] teamflow_saga::StoreError),

    #[error("no snapshot for saga '{saga_id}' in '{dir}'")]
    SagaNotFound { saga_id: String, dir: PathBuf },

    #[error("failed to render JSON output")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
