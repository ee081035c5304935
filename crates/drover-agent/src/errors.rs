use std::fmt::{self, Display};
use thiserror::Error;

/// Top-level error type for the drover-agent crate.
///
/// Busy rejections and subprocess failures are surfaced as session
/// events rather than errors, so the session stays reusable.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Protocol violations against the subprocess's one-reply-per-turn contract.
///
/// These are always recovered locally: the offending input is dropped and
/// logged. Propagating them would needlessly terminate a healthy session,
/// and forwarding them would desynchronize the subprocess's own accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    AnswerForRejectedQuestion { id: String },
    AnswerAlreadySentThisTurn { id: String },
    QuestionAlreadyAnswered { id: String },
    FreeTextWhileQuestionPending,
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnswerForRejectedQuestion { id } => {
                write!(f, "answer for permanently rejected question '{id}'")
            }
            Self::AnswerAlreadySentThisTurn { id } => {
                write!(f, "answer for '{id}' but an answer was already sent this turn")
            }
            Self::QuestionAlreadyAnswered { id } => {
                write!(f, "question '{id}' was already answered")
            }
            Self::FreeTextWhileQuestionPending => {
                write!(f, "free-text message while a question is pending")
            }
        }
    }
}
