//! Rendering prompts for chat and answers for the tool's hooks.

use serde_json::{json, Value};
use tlink_capture::{StopReason, TodoState, TodoStatus, TranscriptSummary};
use tlink_core::{ParsedPrompt, PermissionDecision, PromptKind};

use super::waiter::PromptAnswer;

/// Keycap emoji shown next to options 1 to 4.
const NUMBER_EMOJI: [&str; 4] = [
    "1\u{fe0f}\u{20e3}",
    "2\u{fe0f}\u{20e3}",
    "3\u{fe0f}\u{20e3}",
    "4\u{fe0f}\u{20e3}",
];

/// Reaction names matching [`NUMBER_EMOJI`].
const NUMBER_REACTIONS: [&str; 4] = ["one", "two", "three", "four"];

/// Reaction name that selects option `index`, if it has one.
pub fn reaction_for(index: usize) -> Option<&'static str> {
    NUMBER_REACTIONS.get(index).copied()
}

/// Renders a prompt as chat markdown.
///
/// Fallback prompts render exactly like reconstructed ones.
pub fn format_prompt(prompt: &ParsedPrompt) -> String {
    let mut lines = Vec::new();

    let header = match prompt.kind {
        PromptKind::Permission => ":lock: *Permission needed*",
        PromptKind::Question => ":question: *Input needed*",
    };
    lines.push(header.to_string());

    let question = prompt.question.trim();
    if !question.is_empty() {
        lines.push(format!("*{question}*"));
    }
    lines.push(String::new());

    for option in &prompt.options {
        let marker = NUMBER_EMOJI
            .get(option.index)
            .map(|e| (*e).to_string())
            .unwrap_or_else(|| format!("{}.", option.display_number()));
        lines.push(format!("{marker} *{}*", option.label));
        if let Some(description) = option.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("   _{description}_"));
        }
    }

    if prompt.kind == PromptKind::Question {
        lines.push(":speech_balloon: *Other* (reply in thread)".to_string());
    }
    lines.push(String::new());

    let hints: Vec<&str> = prompt
        .options
        .iter()
        .filter_map(|o| NUMBER_EMOJI.get(o.index).copied())
        .collect();
    let instruction = if prompt.multi_select {
        format!("_React with one or more: {}_", hints.join(" "))
    } else if prompt.kind == PromptKind::Permission {
        format!("_React with {} (or :+1: / :-1:)_", hints.join(" "))
    } else {
        format!("_React with {}_", hints.join(" "))
    };
    lines.push(instruction);

    lines.join("\n")
}

/// Status line appended to a prompt once it is answered.
pub fn format_answered(prompt: &ParsedPrompt, answer: &PromptAnswer) -> String {
    match answer {
        PromptAnswer::Choice(index) => match prompt.option_at(*index) {
            Some(option) => format!(
                ":white_check_mark: Answered: *{}* ({})",
                option.label,
                option.display_number()
            ),
            None => format!(":grey_question: Answered option {}", index + 1),
        },
        PromptAnswer::Text(text) => format!(":speech_balloon: Answered: {text}"),
    }
}

/// Maps an answer to a permission decision. Free text denies.
pub fn decision_for(prompt: &ParsedPrompt, answer: &PromptAnswer) -> PermissionDecision {
    match answer {
        PromptAnswer::Choice(index) => prompt
            .permission_decision(*index)
            .unwrap_or(PermissionDecision::Deny),
        PromptAnswer::Text(_) => PermissionDecision::Deny,
    }
}

/// Hook output for a permission request.
pub fn permission_hook_output(decision: PermissionDecision, message: Option<&str>) -> Value {
    let mut decision_json = json!({ "behavior": decision.behavior() });
    if let (Some(message), Some(obj)) = (message, decision_json.as_object_mut()) {
        obj.insert("message".to_string(), Value::String(message.to_string()));
    }
    json!({
        "hookSpecificOutput": {
            "hookEventName": "PermissionRequest",
            "decision": decision_json,
        }
    })
}

/// Hook output answering a structured question.
pub fn question_hook_output(prompt: &ParsedPrompt, answer: &PromptAnswer) -> Value {
    let value = match answer {
        PromptAnswer::Choice(index) => prompt
            .option_at(*index)
            .map(|o| o.label.clone())
            .unwrap_or_else(|| (index + 1).to_string()),
        PromptAnswer::Text(text) => text.clone(),
    };
    json!({
        "hookSpecificOutput": {
            "hookEventName": "PreToolUse",
            "output": {
                "decision": "answered",
                "answers": { "question_0": value },
            }
        }
    })
}

/// Files listed in a stop summary before the rest are counted.
const SUMMARY_FILE_LIMIT: usize = 10;

/// Renders the assistant's task list for the session's progress message.
pub fn format_todos(status: &TodoStatus) -> String {
    let done = status.count(TodoState::Completed);
    let header = if status.is_complete() {
        format!(":white_check_mark: *Tasks* {done}/{} done", status.items.len())
    } else {
        format!(":clipboard: *Tasks* {done}/{} done", status.items.len())
    };
    let mut lines = vec![header];
    for item in &status.items {
        let line = match item.status {
            TodoState::Completed => format!(":ballot_box_with_check: ~{}~", item.content),
            TodoState::InProgress => format!(
                ":arrow_forward: *{}*",
                item.active_form.as_deref().unwrap_or(&item.content)
            ),
            TodoState::Pending => format!(":white_square: {}", item.content),
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// Renders what a session did when it stops. `None` when there is nothing
/// worth posting.
pub fn format_summary(summary: &TranscriptSummary) -> Option<String> {
    let mut sections = Vec::new();
    if let Some(response) = &summary.response {
        sections.push(response.text.clone());
    }
    if !summary.modified_files.is_empty() {
        let mut lines = vec![format!(
            ":pencil2: *Modified files* ({})",
            summary.modified_files.len()
        )];
        for path in summary.modified_files.iter().take(SUMMARY_FILE_LIMIT) {
            lines.push(format!("• `{}`", path.display()));
        }
        if summary.modified_files.len() > SUMMARY_FILE_LIMIT {
            lines.push(format!(
                "_and {} more_",
                summary.modified_files.len() - SUMMARY_FILE_LIMIT
            ));
        }
        sections.push(lines.join("\n"));
    }
    if sections.is_empty() {
        return None;
    }
    if summary.stop_reason == StopReason::MaxTokens {
        sections.push(":warning: _Stopped at the output limit._".to_string());
    }
    Some(sections.join("\n\n"))
}
