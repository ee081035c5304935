//! Wire types for the agent subprocess: newline-delimited JSON records on
//! its output channel, and free-text/tool-result replies on its input
//! channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool the subprocess uses to ask the human a structured question.
pub const QUESTION_TOOL: &str = "ask_user";

/// Tool the subprocess uses to delegate work to a nested agent.
pub const SUBAGENT_TOOL: &str = "spawn_agent";

/// Tools that mutate external issue-tracker state. Seeing one of these
/// means dependent live-sync polling should refresh immediately.
pub const TRACKER_MUTATING_TOOLS: &[&str] = &["tracker_update_item", "tracker_close_item"];

/// Tools that edit a file named by a `path` argument; their before/after
/// contents are diffed for display.
pub const FILE_EDIT_TOOLS: &[&str] = &["write_file", "edit_file", "apply_patch"];

/// One raw record read from the subprocess's output channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        content: Value,
    },
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    Error {
        message: String,
    },
    ToolRejected {
        id: String,
        #[serde(rename = "isQuestion", default)]
        is_question: bool,
    },
    Done,
}

/// One record written to the subprocess's input channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentInput {
    User { content: String },
    ToolResult { id: String, content: String },
}

/// One sub-question inside a question tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub header: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub multi_select: bool,
}

/// A structured question raised by the subprocess, awaiting one human
/// answer keyed by the originating tool-use id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Vec<SubQuestion>,
}

impl PendingQuestion {
    /// Builds a question from the question tool's input payload.
    ///
    /// Accepts `{"questions": [{header, question|prompt, options,
    /// multiSelect}]}`; options may be plain strings or `{label}` objects.
    /// Malformed payloads degrade to a single free-form sub-question so
    /// the call can still be answered.
    pub fn from_tool_input(id: &str, input: &Value) -> Self {
        let questions = input
            .get("questions")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(parse_sub_question).collect::<Vec<_>>())
            .unwrap_or_default();

        let questions = if questions.is_empty() {
            vec![SubQuestion {
                header: String::new(),
                prompt: input
                    .get("question")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                options: Vec::new(),
                multi_select: false,
            }]
        } else {
            questions
        };

        Self {
            tool_use_id: id.to_string(),
            questions,
        }
    }
}

fn parse_sub_question(entry: &Value) -> SubQuestion {
    let options = entry
        .get("options")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(|option| {
                    option.as_str().map(str::to_string).or_else(|| {
                        option
                            .get("label")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    SubQuestion {
        header: entry
            .get("header")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        prompt: entry
            .get("question")
            .or_else(|| entry.get("prompt"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        options,
        multi_select: entry
            .get("multiSelect")
            .or_else(|| entry.get("multi_select"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Parses one output-channel line into a raw event.
pub fn parse_event_line(line: &str) -> Result<RawEvent, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encodes one input-channel record, newline-terminated.
pub fn encode_input_line(input: &AgentInput) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(input)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_tool_use_record() {
        let event = parse_event_line(
            r#"{"kind":"tool_use","id":"t1","name":"write_file","input":{"path":"a.rs"}}"#,
        )
        .expect("parse should succeed");

        assert_eq!(
            event,
            RawEvent::ToolUse {
                id: "t1".to_string(),
                name: "write_file".to_string(),
                input: json!({"path":"a.rs"}),
            }
        );
    }

    #[test]
    fn parses_tool_rejected_with_camel_case_flag() {
        let event = parse_event_line(r#"{"kind":"tool_rejected","id":"q1","isQuestion":true}"#)
            .expect("parse should succeed");
        assert_eq!(
            event,
            RawEvent::ToolRejected {
                id: "q1".to_string(),
                is_question: true,
            }
        );
    }

    #[test]
    fn encodes_tool_result_reply_as_one_line() {
        let line = encode_input_line(&AgentInput::ToolResult {
            id: "q1".to_string(),
            content: "option A".to_string(),
        })
        .expect("encode should succeed");

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let round: AgentInput = serde_json::from_str(line.trim()).expect("round trip");
        assert!(matches!(round, AgentInput::ToolResult { .. }));
    }

    #[test]
    fn question_payload_with_option_objects_and_strings() {
        let input = json!({
            "questions": [
                {
                    "header": "Scope",
                    "question": "Which module?",
                    "options": [{"label": "parser"}, "lexer"],
                    "multiSelect": true
                }
            ]
        });

        let question = PendingQuestion::from_tool_input("q1", &input);
        assert_eq!(question.tool_use_id, "q1");
        assert_eq!(question.questions.len(), 1);
        assert_eq!(question.questions[0].options, vec!["parser", "lexer"]);
        assert!(question.questions[0].multi_select);
    }

    #[test]
    fn malformed_question_payload_degrades_to_free_form() {
        let question = PendingQuestion::from_tool_input("q1", &json!({"unexpected": 1}));
        assert_eq!(question.questions.len(), 1);
        assert!(question.questions[0].options.is_empty());
    }
}
