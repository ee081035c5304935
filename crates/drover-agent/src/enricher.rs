//! Converts the subprocess's raw event stream into a protocol-safe,
//! semantically enriched output stream.
//!
//! Events are consumed strictly in arrival order: duration and diff
//! computation depend on tool-use→tool-result pairing, and the turn guard
//! depends on question ordering.

use crate::{
    AgentInput, CompletionMarker, FILE_EDIT_TOOLS, MarkerBuffer, PendingQuestion, ProtocolViolation,
    QUESTION_TOOL, RawEvent, SUBAGENT_TOOL, SessionEvent, TRACKER_MUTATING_TOOLS, TurnEffect,
    TurnInput, TurnState,
};
use serde_json::Value;
use similar::TextDiff;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Reply sent for question tool calls that are never surfaced.
const SUPERSEDED_REPLY: &str =
    "An answer was already provided for this turn; proceed with the earlier answer.";

/// Result of feeding one raw event through the enricher.
#[derive(Debug, Default)]
pub struct EnrichmentOutput {
    pub events: Vec<SessionEvent>,
    /// Synthetic replies that must be written to the subprocess to keep
    /// its one-reply-per-call accounting satisfied.
    pub replies: Vec<AgentInput>,
}

/// Result of requesting that an answer be sent.
#[derive(Debug)]
pub enum AnswerOutcome {
    Forward {
        input: AgentInput,
        /// Follow-up events, e.g. the next queued question surfacing.
        events: Vec<SessionEvent>,
    },
    Dropped(ProtocolViolation),
}

struct FileSnapshot {
    path: PathBuf,
    content: Option<String>,
}

struct SubagentTracker {
    started: Instant,
}

pub struct EventEnricher {
    working_dir: PathBuf,
    turn: TurnState,
    markers: MarkerBuffer,
    snapshots: HashMap<String, FileSnapshot>,
    subagents: HashMap<String, SubagentTracker>,
    active_question: Option<PendingQuestion>,
    queued_questions: VecDeque<PendingQuestion>,
    saw_done: bool,
}

impl EventEnricher {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            turn: TurnState::new(),
            markers: MarkerBuffer::new(),
            snapshots: HashMap::new(),
            subagents: HashMap::new(),
            active_question: None,
            queued_questions: VecDeque::new(),
            saw_done: false,
        }
    }

    pub fn set_working_dir(&mut self, working_dir: impl Into<PathBuf>) {
        self.working_dir = working_dir.into();
    }

    pub fn has_active_question(&self) -> bool {
        self.active_question.is_some()
    }

    pub fn active_question(&self) -> Option<&PendingQuestion> {
        self.active_question.as_ref()
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// Prepares for a fresh subprocess stream. Session-scope state
    /// survives: the answered/rejected id sets, and any still-unanswered
    /// active/queued questions (their answers are fire-and-forget).
    pub fn begin_execution(&mut self) {
        self.turn.start_stream();
        self.markers.clear();
        self.snapshots.clear();
        self.subagents.clear();
        self.saw_done = false;
    }

    /// Full reset, including the answered/rejected id sets and any
    /// pending questions.
    pub fn reset(&mut self) {
        self.turn.reset();
        self.active_question = None;
        self.queued_questions.clear();
        self.begin_execution();
    }

    pub fn handle(&mut self, raw: RawEvent) -> EnrichmentOutput {
        let mut out = EnrichmentOutput::default();
        match raw {
            RawEvent::ToolUse { id, name, input } => self.on_tool_use(id, name, input, &mut out),
            RawEvent::ToolResult { id, content } => self.on_tool_result(id, content, &mut out),
            RawEvent::Text { content } => {
                for marker in self.markers.push(&content) {
                    out.events.push(SessionEvent::MarkerDetected { marker });
                }
                out.events.push(SessionEvent::AssistantText { content });
            }
            RawEvent::Thinking { content } => {
                out.events.push(SessionEvent::Thinking { content });
            }
            RawEvent::Error { message } => {
                out.events.push(SessionEvent::Error { message });
            }
            RawEvent::ToolRejected { id, is_question } => {
                self.on_tool_rejected(id, is_question, &mut out);
            }
            RawEvent::Done => {
                self.saw_done = true;
                self.turn.apply(TurnInput::TurnDone);
                out.events.push(SessionEvent::TurnExit);
            }
        }
        out
    }

    /// Applies the turn guard to an answer and, when allowed, produces the
    /// input to forward. Forwarding is fire-and-forget: if the subprocess
    /// exits before reading the reply, the answer is lost.
    pub fn answer(&mut self, id: &str, content: &str) -> AnswerOutcome {
        match self.turn.apply(TurnInput::AnswerRequested { id: id.to_string() }) {
            TurnEffect::ForwardAnswer { id } => {
                let mut events = Vec::new();
                if self
                    .active_question
                    .as_ref()
                    .is_some_and(|question| question.tool_use_id == id)
                {
                    self.active_question = None;
                    self.surface_next_queued(&mut events);
                }
                AnswerOutcome::Forward {
                    input: AgentInput::ToolResult {
                        id,
                        content: content.to_string(),
                    },
                    events,
                }
            }
            TurnEffect::DropAnswer(violation) => AnswerOutcome::Dropped(violation),
            other => {
                debug!(?other, "unexpected turn effect for answer request");
                AnswerOutcome::Dropped(ProtocolViolation::QuestionAlreadyAnswered {
                    id: id.to_string(),
                })
            }
        }
    }

    fn on_tool_use(&mut self, id: String, name: String, input: Value, out: &mut EnrichmentOutput) {
        if name == QUESTION_TOOL {
            match self.turn.apply(TurnInput::QuestionOpened { id: id.clone() }) {
                TurnEffect::SurfaceQuestion { id } => {
                    let question = PendingQuestion::from_tool_input(&id, &input);
                    if self.active_question.is_some() {
                        // Another question is active at session scope;
                        // surface this one once that answer goes out.
                        self.queued_questions.push_back(question);
                    } else {
                        self.active_question = Some(question.clone());
                        out.events.push(SessionEvent::Question { question });
                    }
                }
                TurnEffect::SynthesizeReply { id } => {
                    warn!(%id, "question superseded within turn; sending synthetic reply");
                    out.replies.push(AgentInput::ToolResult {
                        id,
                        content: SUPERSEDED_REPLY.to_string(),
                    });
                }
                _ => {}
            }
            return;
        }

        if TRACKER_MUTATING_TOOLS.contains(&name.as_str()) {
            out.events.push(SessionEvent::TrackerMutated { tool: name.clone() });
        }

        if name == SUBAGENT_TOOL {
            let task = input
                .get("task")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.subagents.insert(
                id.clone(),
                SubagentTracker {
                    started: Instant::now(),
                },
            );
            out.events.push(SessionEvent::SubagentSpawned {
                id: id.clone(),
                task,
            });
        }

        if FILE_EDIT_TOOLS.contains(&name.as_str())
            && let Some(path) = input.get("path").and_then(Value::as_str)
        {
            let path = self.resolve_path(path);
            let content = std::fs::read_to_string(&path).ok();
            self.snapshots.insert(id.clone(), FileSnapshot { path, content });
        }

        self.turn.apply(TurnInput::ToolOpened {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        });
        out.events.push(SessionEvent::ToolCall { id, name, input });
    }

    fn on_tool_result(&mut self, id: String, content: Value, out: &mut EnrichmentOutput) {
        let (name, duration_ms) =
            match self.turn.apply(TurnInput::ToolClosed { id: id.clone() }) {
                TurnEffect::CloseTool(invocation) => (
                    invocation.name,
                    invocation.started.elapsed().as_millis() as u64,
                ),
                _ => {
                    debug!(%id, "tool result without a paired tool use");
                    (String::new(), 0)
                }
            };

        if let Some(snapshot) = self.snapshots.remove(&id)
            && let Some(diff) = compute_file_diff(&snapshot)
        {
            out.events.push(SessionEvent::FileDiff {
                path: snapshot.path.display().to_string(),
                diff,
            });
        }

        if let Some(tracker) = self.subagents.remove(&id) {
            out.events.push(SessionEvent::SubagentCompleted {
                id: id.clone(),
                duration_ms: tracker.started.elapsed().as_millis() as u64,
            });
        }

        out.events.push(SessionEvent::ToolResult {
            id,
            name,
            content,
            duration_ms,
        });
    }

    fn on_tool_rejected(&mut self, id: String, is_question: bool, out: &mut EnrichmentOutput) {
        let effect = self.turn.apply(TurnInput::Rejected { id: id.clone() });
        if is_question || matches!(effect, TurnEffect::DiscardRejected { was_open_question: true })
        {
            if self
                .active_question
                .as_ref()
                .is_some_and(|question| question.tool_use_id == id)
            {
                self.active_question = None;
                self.surface_next_queued(&mut out.events);
            }
            self.queued_questions
                .retain(|question| question.tool_use_id != id);
        }
        out.events.push(SessionEvent::System {
            message: format!("agent rejected tool call '{id}'"),
        });
    }

    fn surface_next_queued(&mut self, events: &mut Vec<SessionEvent>) {
        if let Some(next) = self.queued_questions.pop_front() {
            self.active_question = Some(next.clone());
            events.push(SessionEvent::Question { question: next });
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.working_dir.join(candidate)
        }
    }
}

fn compute_file_diff(snapshot: &FileSnapshot) -> Option<String> {
    let before = snapshot.content.clone().unwrap_or_default();
    let after = std::fs::read_to_string(&snapshot.path).unwrap_or_default();
    if before == after {
        return None;
    }
    let diff = TextDiff::from_lines(&before, &after)
        .unified_diff()
        .context_radius(3)
        .to_string();
    Some(diff)
}

/// Strongest marker wins when an iteration produced several.
pub fn strongest_marker(markers: &[CompletionMarker]) -> Option<CompletionMarker> {
    if markers.contains(&CompletionMarker::All) {
        Some(CompletionMarker::All)
    } else if markers.contains(&CompletionMarker::Item) {
        Some(CompletionMarker::Item)
    } else {
        None
    }
}
