//! Injected git command runner.
//!
//! The resolver depends on this trait rather than on `tokio::process`
//! directly, so tests drive scripted runners and assert exactly which
//! commands were issued.

use crate::WorkspaceError;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Runs `git <args>` with `root` as the working directory and returns
    /// trimmed stdout. Nonzero exit is a `GitCommand` error carrying
    /// stderr.
    async fn run(&self, root: &Path, args: &[&str]) -> Result<String, WorkspaceError>;
}

pub struct CommandGitRunner;

#[async_trait]
impl GitRunner for CommandGitRunner {
    async fn run(&self, root: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        debug!(root = %root.display(), ?args, "running git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorkspaceError::GitCommand {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
