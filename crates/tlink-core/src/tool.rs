//! Typed tool-call inputs.
//!
//! Tool payloads arrive as arbitrary JSON. They are resolved by tool name
//! into one of three shapes: a permission-gated tool, a question to the
//! user, or an unknown tool carried through untouched.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tool name of the assistant's question-asking tool.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// Tools that pause for a local permission prompt before running.
const PERMISSION_TOOLS: &[&str] = &[
    "Bash",
    "Edit",
    "MultiEdit",
    "Write",
    "NotebookEdit",
    "WebFetch",
    "WebSearch",
];

/// Hard cap on questions per call and options per question.
pub const MAX_QUESTION_ITEMS: usize = 4;

// ============================================================================
// Tool Input Union
// ============================================================================

/// Tool input resolved by tool name.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Permission(PermissionInput),
    Question(QuestionInput),
    Unknown {
        tool_name: String,
        input: serde_json::Value,
    },
}

impl ToolInput {
    /// Resolves a raw tool call into a typed input.
    ///
    /// A payload that does not fit the expected shape for its tool falls
    /// back to `Unknown` so callers still see the raw data.
    pub fn from_tool_call(tool_name: &str, input: serde_json::Value) -> Self {
        if tool_name == QUESTION_TOOL {
            return match serde_json::from_value::<QuestionPayload>(input.clone()) {
                Ok(payload) => Self::Question(payload.into()),
                Err(e) => {
                    debug!(tool_name, error = %e, "Question payload did not match, treating as unknown");
                    Self::Unknown {
                        tool_name: tool_name.to_string(),
                        input,
                    }
                }
            };
        }

        if PERMISSION_TOOLS.contains(&tool_name) {
            let fields: PermissionFields =
                serde_json::from_value(input.clone()).unwrap_or_default();
            return Self::Permission(PermissionInput {
                tool_name: tool_name.to_string(),
                command: fields.command,
                file_path: fields.file_path.or(fields.notebook_path),
                url: fields.url,
                query: fields.query,
                description: fields.description,
                raw: input,
            });
        }

        Self::Unknown {
            tool_name: tool_name.to_string(),
            input,
        }
    }

    /// Name of the tool that produced this input.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Permission(p) => &p.tool_name,
            Self::Question(_) => QUESTION_TOOL,
            Self::Unknown { tool_name, .. } => tool_name,
        }
    }

    /// Returns the question input, if this is one.
    pub fn as_question(&self) -> Option<&QuestionInput> {
        match self {
            Self::Question(q) => Some(q),
            _ => None,
        }
    }
}

// ============================================================================
// Permission Shape
// ============================================================================

/// Input of a permission-gated tool, reduced to what a human needs to decide.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionInput {
    pub tool_name: String,
    pub command: Option<String>,
    pub file_path: Option<String>,
    pub url: Option<String>,
    pub query: Option<String>,
    pub description: Option<String>,
    /// Original payload.
    pub raw: serde_json::Value,
}

impl PermissionInput {
    /// One-line description of what the tool is about to do.
    pub fn summary(&self) -> String {
        let target = self
            .command
            .as_deref()
            .or(self.file_path.as_deref())
            .or(self.url.as_deref())
            .or(self.query.as_deref());
        match target {
            Some(t) => format!("{}: {}", self.tool_name, t),
            None => self.tool_name.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PermissionFields {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    notebook_path: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

// ============================================================================
// Question Shape
// ============================================================================

/// One selectable option as supplied by the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One question with its options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSpec {
    #[serde(default)]
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionSpec>,
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
}

/// Input of the question tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionInput {
    pub questions: Vec<QuestionSpec>,
}

impl QuestionInput {
    /// The first question, which is the one rendered as a prompt.
    pub fn primary(&self) -> Option<&QuestionSpec> {
        self.questions.first()
    }

    /// Checks the tool's structural limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.questions.is_empty() {
            return Err("missing questions".to_string());
        }
        if self.questions.len() > MAX_QUESTION_ITEMS {
            return Err(format!("at most {MAX_QUESTION_ITEMS} questions allowed"));
        }
        for (i, q) in self.questions.iter().enumerate() {
            if q.options.len() > MAX_QUESTION_ITEMS {
                return Err(format!("question {i} has more than {MAX_QUESTION_ITEMS} options"));
            }
        }
        Ok(())
    }
}

/// Accepts both the multi-question form and a bare single question.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionPayload {
    Many { questions: Vec<QuestionSpec> },
    Single(QuestionSpec),
}

impl From<QuestionPayload> for QuestionInput {
    fn from(payload: QuestionPayload) -> Self {
        match payload {
            QuestionPayload::Many { questions } => Self { questions },
            QuestionPayload::Single(q) => Self { questions: vec![q] },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bash_resolves_to_permission() {
        let input = ToolInput::from_tool_call(
            "Bash",
            json!({"command": "cargo fmt", "description": "Format"}),
        );
        match input {
            ToolInput::Permission(p) => {
                assert_eq!(p.command.as_deref(), Some("cargo fmt"));
                assert_eq!(p.summary(), "Bash: cargo fmt");
            }
            other => panic!("expected permission, got {other:?}"),
        }
    }

    #[test]
    fn test_edit_uses_file_path() {
        let input = ToolInput::from_tool_call("Edit", json!({"file_path": "/a/b.rs"}));
        let ToolInput::Permission(p) = input else {
            panic!("expected permission");
        };
        assert_eq!(p.summary(), "Edit: /a/b.rs");
    }

    #[test]
    fn test_question_multi_form() {
        let input = ToolInput::from_tool_call(
            QUESTION_TOOL,
            json!({"questions": [{
                "question": "Which database?",
                "header": "DB",
                "options": [{"label": "PostgreSQL"}, {"label": "MongoDB", "description": "doc store"}],
                "multiSelect": true
            }]}),
        );
        let q = input.as_question().unwrap().primary().unwrap();
        assert_eq!(q.question, "Which database?");
        assert!(q.multi_select);
        assert_eq!(q.options.len(), 2);
        assert_eq!(q.options[1].description.as_deref(), Some("doc store"));
    }

    #[test]
    fn test_question_bare_form() {
        let input = ToolInput::from_tool_call(
            QUESTION_TOOL,
            json!({"options": [{"label": "PostgreSQL"}, {"label": "MongoDB"}]}),
        );
        let q = input.as_question().unwrap().primary().unwrap();
        assert_eq!(q.question, "");
        assert_eq!(q.options[0].label, "PostgreSQL");
    }

    #[test]
    fn test_malformed_question_is_unknown() {
        let input = ToolInput::from_tool_call(QUESTION_TOOL, json!("not an object"));
        assert!(matches!(input, ToolInput::Unknown { .. }));
        assert_eq!(input.tool_name(), QUESTION_TOOL);
    }

    #[test]
    fn test_unknown_tool() {
        let input = ToolInput::from_tool_call("mcp__github__create_issue", json!({"title": "x"}));
        assert!(matches!(input, ToolInput::Unknown { ref tool_name, .. } if tool_name == "mcp__github__create_issue"));
    }

    #[test]
    fn test_question_validation_limits() {
        let option = OptionSpec {
            label: "x".to_string(),
            description: None,
        };
        let q = QuestionSpec {
            question: "q".to_string(),
            header: None,
            options: vec![option; 5],
            multi_select: false,
        };
        let input = QuestionInput { questions: vec![q] };
        assert!(input.validate().is_err());
        assert!(QuestionInput { questions: vec![] }.validate().is_err());
    }
}
