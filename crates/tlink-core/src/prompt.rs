//! Structured multiple-choice prompts reconstructed for remote answering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Label used when option 1 of a permission prompt scrolled out of view.
pub const DEFAULT_FIRST_OPTION_LABEL: &str = "Yes";

/// Label used when option 2 of a three-option permission prompt is missing.
pub const DEFAULT_SECOND_OPTION_LABEL: &str = "Approve this time";

/// What the prompt is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Tool permission request (2 or 3 options).
    Permission,
    /// Question from the assistant (2 to 4 options).
    Question,
}

impl PromptKind {
    /// Smallest option count a well-formed prompt of this kind has.
    pub const fn min_options(&self) -> usize {
        2
    }

    /// Largest option count a well-formed prompt of this kind has.
    pub const fn max_options(&self) -> usize {
        match self {
            Self::Permission => 3,
            Self::Question => 4,
        }
    }

    /// Returns true if `count` options is plausible for this kind.
    pub fn accepts_count(&self, count: usize) -> bool {
        (self.min_options()..=self.max_options()).contains(&count)
    }
}

/// How the option list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    /// Taken from the tool call's machine-readable input.
    Structured,
    /// Rebuilt from captured terminal text.
    Reconstructed,
    /// Generic approve/deny prompt used when nothing could be rebuilt.
    Fallback,
}

impl fmt::Display for PromptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Reconstructed => write!(f, "reconstructed"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// One selectable option.
///
/// `index` is 0-based; the number shown to users is `index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOption {
    pub index: usize,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PromptOption {
    pub fn new(index: usize, label: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
            description: None,
        }
    }

    /// 1-based number as displayed in the terminal.
    pub fn display_number(&self) -> usize {
        self.index + 1
    }
}

/// A reconstructed multiple-choice prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPrompt {
    pub kind: PromptKind,
    /// Question or context line. Empty when none was found.
    pub question: String,
    pub options: Vec<PromptOption>,
    #[serde(default)]
    pub multi_select: bool,
    pub source: PromptSource,
}

impl ParsedPrompt {
    /// Builds a prompt from ordered labels, assigning indices from 0.
    pub fn from_labels<I, S>(kind: PromptKind, question: impl Into<String>, labels: I, source: PromptSource) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = labels
            .into_iter()
            .enumerate()
            .map(|(index, label)| PromptOption::new(index, label))
            .collect();
        Self {
            kind,
            question: question.into(),
            options,
            multi_select: false,
            source,
        }
    }

    /// Safe default used when reconstruction has insufficient data.
    pub fn generic_binary(kind: PromptKind, question: impl Into<String>) -> Self {
        Self::from_labels(kind, question, ["Approve", "Deny"], PromptSource::Fallback)
    }

    /// Option labels in display order.
    pub fn labels(&self) -> Vec<&str> {
        self.options.iter().map(|o| o.label.as_str()).collect()
    }

    /// Looks up an option by 0-based index.
    pub fn option_at(&self, index: usize) -> Option<&PromptOption> {
        self.options.get(index)
    }

    /// Looks up an option by the 1-based number shown to users.
    pub fn option_by_number(&self, number: usize) -> Option<&PromptOption> {
        number.checked_sub(1).and_then(|i| self.options.get(i))
    }

    /// 0-based index of the last option (the "deny" slot in permission prompts).
    pub fn last_index(&self) -> Option<usize> {
        self.options.len().checked_sub(1)
    }

    /// Maps a chosen option to a permission decision.
    ///
    /// Option 1 allows once, the last option denies, and a middle option
    /// in a three-option prompt allows for the rest of the session.
    pub fn permission_decision(&self, index: usize) -> Option<PermissionDecision> {
        let last = self.last_index()?;
        if index > last {
            return None;
        }
        Some(if index == 0 {
            PermissionDecision::Allow
        } else if index == last {
            PermissionDecision::Deny
        } else {
            PermissionDecision::AllowAlways
        })
    }
}

/// Answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowAlways,
    Deny,
}

impl PermissionDecision {
    /// Hook behavior string understood by the tool.
    pub fn behavior(&self) -> &'static str {
        match self {
            Self::Allow | Self::AllowAlways => "allow",
            Self::Deny => "deny",
        }
    }
}
