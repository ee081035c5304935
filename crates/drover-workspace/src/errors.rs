use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git {args} failed: {stderr}")]
    GitCommand { args: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worktree record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("invalid unit id '{0}'")]
    InvalidUnit(String),
}
