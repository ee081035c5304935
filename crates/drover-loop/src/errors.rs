use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Agent(#[from] drover_agent::AgentError),

    #[error(transparent)]
    Workspace(#[from] drover_workspace::WorkspaceError),

    #[error("tracker: {0}")]
    Tracker(String),
}
