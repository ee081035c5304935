//! Per-turn protocol state.
//!
//! The subprocess requires exactly one reply per question tool call but
//! does not guard it. All turn bookkeeping lives in one state value with a
//! single transition function, so the one-answer-per-turn invariant is a
//! checked transition rather than four independently mutated collections.

use crate::ProtocolViolation;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// One live tool invocation, exclusively owned by the turn that created
/// it. Removed when its paired result arrives.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub started: Instant,
}

/// Input to the turn transition function.
#[derive(Debug)]
pub enum TurnInput {
    /// Non-question tool call opened.
    ToolOpened { id: String, name: String, input: Value },
    /// Question tool call arrived.
    QuestionOpened { id: String },
    /// Paired result arrived for a tool call.
    ToolClosed { id: String },
    /// Caller wants to send an answer for this question id.
    AnswerRequested { id: String },
    /// The subprocess itself declined the call.
    Rejected { id: String },
    /// The subprocess signalled end of turn.
    TurnDone,
}

/// Effect the caller must carry out after a transition.
#[derive(Debug)]
pub enum TurnEffect {
    None,
    /// Surface this question to the human; it is now the turn's open
    /// question.
    SurfaceQuestion { id: String },
    /// Do not surface; send a synthetic "already answered" reply so the
    /// subprocess's own one-reply-per-call accounting stays satisfied.
    SynthesizeReply { id: String },
    /// Forward the answer to the subprocess.
    ForwardAnswer { id: String },
    /// Drop the answer; sending it would be a protocol violation.
    DropAnswer(ProtocolViolation),
    /// A tool call closed; the invocation carries its start time.
    CloseTool(ToolInvocation),
    /// A rejected id was scrubbed from provisional bookkeeping.
    DiscardRejected { was_open_question: bool },
}

#[derive(Debug, Default)]
pub struct TurnState {
    open_tools: HashMap<String, ToolInvocation>,
    questions_this_turn: HashSet<String>,
    answered_this_turn: bool,
    answered_ever: HashSet<String>,
    rejected: HashSet<String>,
    open_question: Option<String>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, input: TurnInput) -> TurnEffect {
        match input {
            TurnInput::ToolOpened { id, name, input } => {
                self.open_tools.insert(
                    id.clone(),
                    ToolInvocation {
                        id,
                        name,
                        input,
                        started: Instant::now(),
                    },
                );
                TurnEffect::None
            }
            TurnInput::QuestionOpened { id } => {
                self.questions_this_turn.insert(id.clone());
                if self.open_question.is_some() || self.answered_this_turn {
                    // Later questions in an unanswered-turn window are
                    // auto-answered and never surfaced.
                    self.answered_ever.insert(id.clone());
                    TurnEffect::SynthesizeReply { id }
                } else {
                    self.open_question = Some(id.clone());
                    TurnEffect::SurfaceQuestion { id }
                }
            }
            TurnInput::ToolClosed { id } => match self.open_tools.remove(&id) {
                Some(invocation) => TurnEffect::CloseTool(invocation),
                None => TurnEffect::None,
            },
            TurnInput::AnswerRequested { id } => {
                if self.rejected.contains(&id) {
                    return TurnEffect::DropAnswer(ProtocolViolation::AnswerForRejectedQuestion {
                        id,
                    });
                }
                if self.answered_ever.contains(&id) {
                    return TurnEffect::DropAnswer(ProtocolViolation::QuestionAlreadyAnswered {
                        id,
                    });
                }
                if self.answered_this_turn {
                    return TurnEffect::DropAnswer(ProtocolViolation::AnswerAlreadySentThisTurn {
                        id,
                    });
                }
                self.answered_this_turn = true;
                self.answered_ever.insert(id.clone());
                if self.open_question.as_deref() == Some(id.as_str()) {
                    self.open_question = None;
                }
                TurnEffect::ForwardAnswer { id }
            }
            TurnInput::Rejected { id } => {
                self.open_tools.remove(&id);
                self.questions_this_turn.remove(&id);
                self.answered_ever.remove(&id);
                let was_open_question = self.open_question.as_deref() == Some(id.as_str());
                if was_open_question {
                    self.open_question = None;
                }
                self.rejected.insert(id);
                TurnEffect::DiscardRejected { was_open_question }
            }
            TurnInput::TurnDone => {
                // An unresolved open question survives "done": the
                // subprocess is waiting for a reply, not failing.
                self.answered_this_turn = false;
                TurnEffect::None
            }
        }
    }

    pub fn open_question(&self) -> Option<&str> {
        self.open_question.as_deref()
    }

    pub fn open_tool(&self, id: &str) -> Option<&ToolInvocation> {
        self.open_tools.get(id)
    }

    pub fn open_tool_count(&self) -> usize {
        self.open_tools.len()
    }

    /// Clears per-stream state for a fresh subprocess execution while
    /// keeping the session-lifetime answered/rejected id sets.
    pub fn start_stream(&mut self) {
        self.open_tools.clear();
        self.questions_this_turn.clear();
        self.answered_this_turn = false;
        self.open_question = None;
    }

    /// Full reset, including session-lifetime id sets.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
