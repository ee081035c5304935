//! Normalized display events emitted by the enricher and session
//! controller, consumed by the presentation layer and the build loop.

use crate::{CompletionMarker, PendingQuestion};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    AssistantText {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        content: Value,
        duration_ms: u64,
    },
    FileDiff {
        path: String,
        diff: String,
    },
    SubagentSpawned {
        id: String,
        task: String,
    },
    SubagentCompleted {
        id: String,
        duration_ms: u64,
    },
    Question {
        question: PendingQuestion,
    },
    MarkerDetected {
        marker: CompletionMarker,
    },
    /// External tracker state was mutated by a tool call; live-sync
    /// polling should refresh immediately.
    TrackerMutated {
        tool: String,
    },
    System {
        message: String,
    },
    Error {
        message: String,
    },
    /// The subprocess signalled end of turn.
    TurnExit,
    /// An execute() was refused because a subprocess handle is already
    /// live for this session.
    Busy,
    /// Terminal notification for one execute(): emitted exactly once,
    /// whether the stream ended normally or was forcibly terminated.
    Complete {
        killed: bool,
    },
}
