//! Per-session execution controller.
//!
//! A session owns at most one live subprocess handle and one linear
//! conversation history. Control while an execution is in flight
//! (answers, free text, kill, iteration stop) travels over an explicit
//! per-session command channel, so ordering is explicit rather than
//! dependent on listener registration order.

use crate::{
    AgentError, AgentInput, AnswerOutcome, AgentProcess, AgentTransport, EventEnricher,
    ProtocolViolation, SessionEvent, SpawnSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    None,
    Plan,
    Build,
    Review,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub mode: Option<SessionMode>,
    pub resume: bool,
}

/// Control input accepted while an execution is in flight.
#[derive(Clone, Debug)]
pub enum SessionCommand {
    Answer { id: String, content: String },
    FreeText { content: String },
    Kill,
    StopForIteration,
}

/// Cloneable control handle usable from any task, including while
/// `execute` holds the session lock.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn answer(&self, id: impl Into<String>, content: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::Answer {
            id: id.into(),
            content: content.into(),
        });
    }

    pub fn free_text(&self, content: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::FreeText {
            content: content.into(),
        });
    }

    pub fn kill(&self) {
        let _ = self.commands.send(SessionCommand::Kill);
    }

    pub fn stop_for_iteration(&self) {
        let _ = self.commands.send(SessionCommand::StopForIteration);
    }
}

pub struct Session {
    id: String,
    working_dir: PathBuf,
    mode: SessionMode,
    history: Vec<HistoryEntry>,
    created_at: SystemTime,
    transport: Arc<dyn AgentTransport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    enricher: EventEnricher,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        working_dir: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let working_dir = working_dir.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4().to_string(),
            enricher: EventEnricher::new(working_dir.clone()),
            working_dir,
            mode: SessionMode::None,
            history: Vec::new(),
            created_at: SystemTime::now(),
            transport,
            events,
            commands_tx,
            commands_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    pub fn set_working_dir(&mut self, working_dir: impl Into<PathBuf>) {
        let working_dir = working_dir.into();
        self.enricher.set_working_dir(working_dir.clone());
        self.working_dir = working_dir;
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SessionMode) {
        self.mode = mode;
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Resets history, tool tracking, and turn-guard state for a fresh
    /// exchange, without deactivating the session's mode.
    pub fn clear(&mut self) {
        self.history.clear();
        self.enricher.reset();
    }

    /// Runs one execution: spawns the subprocess, drives its raw stream
    /// through the enricher, and re-emits every normalized event.
    ///
    /// Does not return until the stream ends or is forcibly terminated.
    /// Exactly one `Complete` notification is emitted per call, on every
    /// path, so callers are never left waiting indefinitely.
    ///
    /// Mutual exclusion is the registry's job: `&mut self` rules out an
    /// overlapping call here, and `SessionRegistry::execute` turns a
    /// failed lock into a `Busy` notification.
    pub async fn execute(
        &mut self,
        prompt: impl Into<String>,
        options: ExecuteOptions,
    ) -> Result<(), AgentError> {
        let prompt = prompt.into();
        if let Some(mode) = options.mode {
            self.mode = mode;
        }

        // Commands sent while idle are stale by definition.
        while self.commands_rx.try_recv().is_ok() {}

        self.history.push(HistoryEntry {
            role: Role::User,
            content: prompt.clone(),
        });
        self.enricher.begin_execution();

        let spec = SpawnSpec {
            working_dir: self.working_dir.clone(),
            prompt,
            mode: self.mode,
            resume: options.resume,
        };
        let mut process = match self.transport.spawn(spec).await {
            Ok(process) => process,
            Err(error) => {
                let _ = self.events.send(SessionEvent::Error {
                    message: error.to_string(),
                });
                let _ = self.events.send(SessionEvent::Complete { killed: false });
                return Ok(());
            }
        };

        info!(session = %self.id, mode = ?self.mode, "execution started");

        let mut assistant_text = String::new();
        let mut killed = false;
        loop {
            tokio::select! {
                raw = process.next_event() => match raw {
                    Some(raw) => {
                        let out = self.enricher.handle(raw);
                        for reply in out.replies {
                            process.send(reply);
                        }
                        for event in out.events {
                            if let SessionEvent::AssistantText { content } = &event {
                                assistant_text.push_str(content);
                            }
                            let _ = self.events.send(event);
                        }
                    }
                    None => {
                        match process.wait_exit().await {
                            Some(code) if code != 0 => {
                                let _ = self.events.send(SessionEvent::Error {
                                    message: format!("agent exited with status {code}"),
                                });
                            }
                            _ if !self.enricher.saw_done() => {
                                let _ = self.events.send(SessionEvent::Error {
                                    message: "agent stream ended unexpectedly".to_string(),
                                });
                            }
                            _ => {}
                        }
                        break;
                    }
                },
                command = self.commands_rx.recv() => match command {
                    Some(SessionCommand::Answer { id, content }) => {
                        match self.enricher.answer(&id, &content) {
                            AnswerOutcome::Forward { input, events } => {
                                process.send(input);
                                for event in events {
                                    let _ = self.events.send(event);
                                }
                            }
                            AnswerOutcome::Dropped(violation) => {
                                warn!(session = %self.id, %violation, "answer dropped");
                            }
                        }
                    }
                    Some(SessionCommand::FreeText { content }) => {
                        if self.enricher.has_active_question() {
                            warn!(
                                session = %self.id,
                                violation = %ProtocolViolation::FreeTextWhileQuestionPending,
                                "free text dropped",
                            );
                        } else {
                            self.history.push(HistoryEntry {
                                role: Role::User,
                                content: content.clone(),
                            });
                            process.send(AgentInput::User { content });
                        }
                    }
                    Some(SessionCommand::Kill) => {
                        process.kill().await;
                        killed = true;
                        break;
                    }
                    Some(SessionCommand::StopForIteration) => {
                        // Internal marker-driven stop: no user-kill notice.
                        process.kill().await;
                        break;
                    }
                    None => break,
                },
            }
        }

        if !assistant_text.is_empty() {
            self.history.push(HistoryEntry {
                role: Role::Assistant,
                content: assistant_text,
            });
        }
        if killed {
            self.enricher.reset();
        }
        debug!(session = %self.id, killed, "execution finished");
        let _ = self.events.send(SessionEvent::Complete { killed });
        Ok(())
    }
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    handle: SessionHandle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Ownership table for concurrent sessions, keyed by session id.
///
/// "At most one live subprocess handle per session" is enforced here: a
/// second execute while one is in flight fails the lock and surfaces a
/// `Busy` notification instead of queueing.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session and returns its id plus its event stream.
    pub fn create(
        &mut self,
        transport: Arc<dyn AgentTransport>,
        working_dir: impl Into<PathBuf>,
    ) -> (String, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::new(transport, working_dir, events_tx.clone());
        let id = session.id().to_string();
        let handle = session.handle();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                handle,
                events_tx,
            },
        );
        (id, events_rx)
    }

    pub fn session(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    pub fn handle(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.handle.clone())
    }

    /// Starts an execution on its own task. Returns false for an unknown
    /// session id. A busy session is a rejected no-op, never a queue.
    pub fn execute(&self, id: &str, prompt: impl Into<String>, options: ExecuteOptions) -> bool {
        let Some(entry) = self.sessions.get(id) else {
            return false;
        };
        match entry.session.clone().try_lock_owned() {
            Ok(mut guard) => {
                let prompt = prompt.into();
                tokio::spawn(async move {
                    let _ = guard.execute(prompt, options).await;
                });
            }
            Err(_) => {
                let _ = entry.events_tx.send(SessionEvent::Busy);
            }
        }
        true
    }

    pub fn kill(&self, id: &str) {
        if let Some(entry) = self.sessions.get(id) {
            entry.handle.kill();
        }
    }

    /// Resets an idle session for a fresh exchange. A running session
    /// must be killed first.
    pub fn clear(&self, id: &str) {
        if let Some(entry) = self.sessions.get(id) {
            match entry.session.try_lock() {
                Ok(mut session) => session.clear(),
                Err(_) => warn!(session = %id, "clear refused: execution in flight"),
            }
        }
    }

    /// Kills any live handle and removes the session.
    pub fn close(&mut self, id: &str) {
        if let Some(entry) = self.sessions.remove(id) {
            entry.handle.kill();
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }
}
