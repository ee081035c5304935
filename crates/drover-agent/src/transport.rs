//! Injected subprocess capability.
//!
//! The agent binary is an external collaborator: it is spawned with a
//! prompt, emits newline-delimited events on stdout, and accepts replies
//! on stdin. Sessions depend on the `AgentTransport` trait, never on
//! `tokio::process` directly, so tests drive scripted fakes.

use crate::session::SessionMode;
use crate::{AgentError, AgentInput, RawEvent, encode_input_line, parse_event_line};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub mode: SessionMode,
    pub resume: bool,
}

/// One live subprocess handle.
#[async_trait]
pub trait AgentProcess: Send {
    /// Next raw event, or `None` when the stream ends.
    async fn next_event(&mut self) -> Option<RawEvent>;

    /// Writes one input record. Fire-and-forget: a write to an exited
    /// subprocess is logged and dropped, not surfaced.
    fn send(&mut self, input: AgentInput);

    /// Terminates the subprocess.
    async fn kill(&mut self);

    /// Exit code once the stream has ended, when known.
    async fn wait_exit(&mut self) -> Option<i32>;
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn AgentProcess>, AgentError>;
}

/// Production transport: spawns the configured agent command.
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentTransport for ProcessTransport {
    async fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn AgentProcess>, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(mode) = mode_flag(spec.mode) {
            cmd.arg("--mode").arg(mode);
        }
        if spec.resume {
            cmd.arg("--resume");
        }
        cmd.current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, working_dir = %spec.working_dir.display(), "spawning agent");
        let mut child = cmd
            .spawn()
            .map_err(|error| AgentError::Transport(format!("spawn {}: {error}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("agent stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Transport("agent stderr was not piped".to_string()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("agent stdin was not piped".to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<AgentInput>();

        // The initial prompt travels the same path as every later reply.
        let _ = input_tx.send(AgentInput::User {
            content: spec.prompt,
        });

        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let line = match encode_input_line(&input) {
                    Ok(line) => line,
                    Err(error) => {
                        warn!(%error, "failed to encode agent input");
                        continue;
                    }
                };
                if let Err(error) = stdin.write_all(line.as_bytes()).await {
                    warn!(%error, "agent stdin closed; input dropped");
                    break;
                }
                if let Err(error) = stdin.flush().await {
                    warn!(%error, "agent stdin flush failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let event = match parse_event_line(&line) {
                    Ok(event) => event,
                    Err(error) => RawEvent::Error {
                        message: format!("unparseable agent event: {error}"),
                    },
                };
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "agent stderr");
            }
        });

        Ok(Box::new(ChildProcess {
            child,
            events: events_rx,
            input: input_tx,
        }))
    }
}

fn mode_flag(mode: SessionMode) -> Option<&'static str> {
    match mode {
        SessionMode::None => None,
        SessionMode::Plan => Some("plan"),
        SessionMode::Build => Some("build"),
        SessionMode::Review => Some("review"),
    }
}

struct ChildProcess {
    child: Child,
    events: mpsc::UnboundedReceiver<RawEvent>,
    input: mpsc::UnboundedSender<AgentInput>,
}

#[async_trait]
impl AgentProcess for ChildProcess {
    async fn next_event(&mut self) -> Option<RawEvent> {
        self.events.recv().await
    }

    fn send(&mut self, input: AgentInput) {
        if self.input.send(input).is_err() {
            warn!("agent input channel closed; reply dropped");
        }
    }

    async fn kill(&mut self) {
        if let Err(error) = self.child.start_kill() {
            debug!(%error, "agent kill failed (already exited?)");
        }
        let _ = self.child.wait().await;
    }

    async fn wait_exit(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }
}
