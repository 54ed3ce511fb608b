//! Reconstruction of multiple-choice prompts.
//!
//! Two paths, tried in order:
//!
//! 1. **Structured**: the tool call carries its own option list (the
//!    question tool does). Labels are used verbatim and no text is scanned.
//! 2. **Reconstructed**: the captured window is scanned backward for a
//!    block of consecutive numbered lines (`1. label`, `2) label`).
//!
//! ```text
//! ... context line          <- nearest plausible line above the block
//! 2. Yes, allow edits       <- block (option 1 scrolled away)
//! 3. No
//! (esc to cancel)           <- trailing non-option lines are skipped
//! ```
//!
//! Anything that does not look like a well-formed prompt yields
//! [`ParseOutcome::InsufficientData`]; callers then fall back to
//! [`ParsedPrompt::generic_binary`].

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use tlink_core::{
    ParsedPrompt, PromptKind, PromptOption, PromptSource, QuestionSpec, ToolInput,
    DEFAULT_FIRST_OPTION_LABEL, DEFAULT_SECOND_OPTION_LABEL,
};

use crate::noise::NoiseFilter;

static OPTION_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)[.)]\s+(.+)$").unwrap());

/// Words at least one option of a permission prompt contains.
const PERMISSION_KEYWORDS: &[&str] = &[
    "yes", "no", "allow", "deny", "approve", "reject", "cancel", "always", "session",
];

/// Leading options that may be missing and filled with defaults.
const MAX_MISSING_OPTIONS: usize = 2;

/// How far above the option block to look for context.
pub const DEFAULT_CONTEXT_LOOKBACK: usize = 20;

/// Context lines shorter than this are ignored.
const MIN_CONTEXT_CHARS: usize = 5;

/// Result of a parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedPrompt),
    /// Not enough evidence for a trustworthy prompt. Not an error.
    InsufficientData { reason: String },
}

impl ParseOutcome {
    fn insufficient(reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            reason: reason.into(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn prompt(&self) -> Option<&ParsedPrompt> {
        match self {
            Self::Parsed(p) => Some(p),
            Self::InsufficientData { .. } => None,
        }
    }

    /// The parsed prompt, or the generic approve/deny prompt.
    pub fn or_generic(self, kind: PromptKind) -> ParsedPrompt {
        match self {
            Self::Parsed(p) => p,
            Self::InsufficientData { .. } => ParsedPrompt::generic_binary(kind, ""),
        }
    }
}

/// A numbered line found during the scan.
#[derive(Debug)]
struct NumberedLine {
    number: usize,
    label: String,
    line_index: usize,
}

/// Backward-scanning option parser.
#[derive(Debug, Clone)]
pub struct OptionParser {
    filter: NoiseFilter,
    context_lookback: usize,
}

impl Default for OptionParser {
    fn default() -> Self {
        Self::new(NoiseFilter::option_scan())
    }
}

impl OptionParser {
    pub fn new(filter: NoiseFilter) -> Self {
        Self {
            filter,
            context_lookback: DEFAULT_CONTEXT_LOOKBACK,
        }
    }

    #[must_use]
    pub fn with_context_lookback(mut self, lines: usize) -> Self {
        self.context_lookback = lines;
        self
    }

    /// Parses a prompt, preferring the tool call's own options.
    pub fn parse(&self, kind: PromptKind, tool_input: Option<&ToolInput>, lines: &[String]) -> ParseOutcome {
        if let Some(question) = tool_input.and_then(ToolInput::as_question).and_then(|q| q.primary()) {
            match Self::from_structured(question) {
                outcome @ ParseOutcome::Parsed(_) => return outcome,
                ParseOutcome::InsufficientData { reason } => {
                    debug!(reason = %reason, "Structured options unusable, scanning captured text");
                }
            }
        }
        self.reconstruct(kind, lines)
    }

    /// Builds a prompt from a question tool's own option list.
    pub fn from_structured(question: &QuestionSpec) -> ParseOutcome {
        let kind = PromptKind::Question;
        let count = question.options.len();
        if !kind.accepts_count(count) {
            return ParseOutcome::insufficient(format!("structured question has {count} options"));
        }

        let options = question
            .options
            .iter()
            .enumerate()
            .map(|(index, spec)| PromptOption {
                index,
                label: spec.label.clone(),
                description: spec.description.clone(),
            })
            .collect();

        ParseOutcome::Parsed(ParsedPrompt {
            kind,
            question: question.question.clone(),
            options,
            multi_select: question.multi_select,
            source: PromptSource::Structured,
        })
    }

    /// Rebuilds a prompt from captured lines (oldest first).
    pub fn reconstruct(&self, kind: PromptKind, lines: &[String]) -> ParseOutcome {
        let block = self.scan_option_block(lines);
        let Some(first) = block.first() else {
            return ParseOutcome::insufficient("no numbered lines");
        };

        for pair in block.windows(2) {
            if let [prev, next] = pair {
                if next.number != prev.number + 1 {
                    return ParseOutcome::insufficient(format!(
                        "options not consecutive ({} then {})",
                        prev.number, next.number
                    ));
                }
            }
        }

        if first.number == 0 {
            return ParseOutcome::insufficient("numbering starts at 0");
        }
        let missing = first.number - 1;
        if missing > MAX_MISSING_OPTIONS {
            return ParseOutcome::insufficient(format!("{missing} leading options missing"));
        }

        let defaults = [DEFAULT_FIRST_OPTION_LABEL, DEFAULT_SECOND_OPTION_LABEL];
        let labels: Vec<String> = defaults
            .iter()
            .take(missing)
            .map(|s| s.to_string())
            .chain(block.iter().map(|o| o.label.clone()))
            .collect();

        if !kind.accepts_count(labels.len()) {
            return ParseOutcome::insufficient(format!(
                "{} options outside {}..={}",
                labels.len(),
                kind.min_options(),
                kind.max_options()
            ));
        }

        if kind == PromptKind::Permission && !has_permission_keyword(&labels) {
            return ParseOutcome::insufficient("no permission keyword in options");
        }

        let question = self.find_context(lines, first.line_index);
        if missing > 0 {
            debug!(missing, "Filled scrolled-away options with defaults");
        }

        ParseOutcome::Parsed(ParsedPrompt::from_labels(
            kind,
            question,
            labels,
            PromptSource::Reconstructed,
        ))
    }

    /// Scans backward for the most recent block of numbered lines.
    ///
    /// Lines below the block are skipped. Once the block has started, the
    /// first line that is not a clean numbered line ends it.
    fn scan_option_block(&self, lines: &[String]) -> Vec<NumberedLine> {
        let mut block = Vec::new();

        for (line_index, raw) in lines.iter().enumerate().rev() {
            let line = raw.trim();

            if let Some(noise) = self.filter.classify(line) {
                trace!(line, rule = noise.name, "Noise line");
                if block.is_empty() {
                    continue;
                }
                break;
            }

            match parse_numbered(line) {
                Some((number, label)) => block.push(NumberedLine {
                    number,
                    label,
                    line_index,
                }),
                None if block.is_empty() => continue,
                None => break,
            }
        }

        block.reverse();
        block
    }

    /// Nearest line above `block_start` that reads like context.
    fn find_context(&self, lines: &[String], block_start: usize) -> String {
        let floor = block_start.saturating_sub(self.context_lookback);
        lines
            .get(floor..block_start)
            .unwrap_or_default()
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|line| {
                line.chars().count() >= MIN_CONTEXT_CHARS
                    && parse_numbered(line).is_none()
                    && !self.filter.is_noise(line)
            })
            .map(str::to_string)
            .unwrap_or_default()
    }
}

fn parse_numbered(line: &str) -> Option<(usize, String)> {
    let caps = OPTION_LINE.captures(line)?;
    let number = caps.get(1)?.as_str().parse().ok()?;
    let label = caps.get(2)?.as_str().trim().to_string();
    Some((number, label))
}

fn has_permission_keyword(labels: &[String]) -> bool {
    labels.iter().any(|label| {
        let lower = label.to_lowercase();
        PERMISSION_KEYWORDS.iter().any(|kw| lower.contains(kw))
    })
}
