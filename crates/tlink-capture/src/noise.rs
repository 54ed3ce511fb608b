//! Noise predicates for captured terminal lines.
//!
//! Status and progress text printed by the assistant can collide with
//! numbered-option syntax (`1.7k tokens` looks like option 1). Each rule is
//! a [`NoisePredicate`]: a regex plus the reason it rejects a line. New
//! rules are appended as data with [`NoiseFilter::with_predicate`].
//!
//! Two built-in sets exist:
//! - [`NoiseFilter::terminal`]: display chrome dropped at capture time
//! - [`NoiseFilter::option_scan`]: the terminal set plus progress keywords,
//!   used while scanning for numbered options

use once_cell::sync::Lazy;
use regex::Regex;

/// One noise rule.
#[derive(Debug, Clone)]
pub struct NoisePredicate {
    pub name: String,
    pub pattern: Regex,
    pub reason: String,
}

impl NoisePredicate {
    /// Compiles a predicate from a pattern string.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        reason: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            reason: reason.into(),
        })
    }

    /// Returns true if the line matches this predicate.
    pub fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// Why a line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseMatch<'a> {
    pub name: &'a str,
    pub reason: &'a str,
}

/// Ordered list of noise predicates. The first match wins.
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    predicates: Vec<NoisePredicate>,
}

// (name, pattern, reason)
const TERMINAL_RULES: &[(&str, &str, &str)] = &[
    (
        "spinner",
        r"^[*+.·•○●◦◉◎⊙⊚⊛⊜⊝✻✽✢✶]+$",
        "spinner glyphs only",
    ),
    ("title_bar", r"^0;", "terminal title update"),
    (
        "status_verb",
        r"(Vibing|Prestidigitating|Julienning|Pondering|Conjuring)",
        "assistant status message",
    ),
    ("thinking_suffix", r"thinking\)$", "thinking indicator"),
    (
        "token_count",
        r"^\d+(?:\.\d+)?k? tokens",
        "token counter",
    ),
    (
        "status_prefix",
        r"^(Checking|Working|Loading|Waiting)",
        "status line",
    ),
    (
        "box_only",
        r"^[─│┌┐└┘├┤┬┴┼═║╔╗╚╝╠╣╦╩╬]+$",
        "box drawing only",
    ),
];

/// Status-line shapes that can pass for numbered options while scanning.
/// Each matches a whole status line, never a word inside prompt text.
const PROGRESS_RULES: &[(&str, &str, &str)] = &[
    (
        "progress_verb",
        r"^(?:\d+[.)]\s+)?[*+·•✻✽✢✶]?\s*[A-Z][a-z]+ing(?:…|\.\.\.)\s*(?:\(.*\))?$",
        "progress verb",
    ),
    (
        "token_progress",
        r"\(\s*(?:[↑↓]\s*)?\d+(?:\.\d+)?k?\s+tokens\b",
        "token progress counter",
    ),
    ("interrupt_hint", r"(?i)\besc to interrupt\b", "interrupt hint"),
];

static TERMINAL: Lazy<NoiseFilter> = Lazy::new(|| NoiseFilter::from_rules(TERMINAL_RULES));

static OPTION_SCAN: Lazy<NoiseFilter> = Lazy::new(|| {
    NoiseFilter::from_rules(TERMINAL_RULES).with_rules(PROGRESS_RULES)
});

impl NoiseFilter {
    /// Empty filter; nothing is noise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Display chrome that is never worth keeping in a capture window.
    pub fn terminal() -> Self {
        TERMINAL.clone()
    }

    /// Filter used while scanning for numbered options.
    pub fn option_scan() -> Self {
        OPTION_SCAN.clone()
    }

    fn from_rules(rules: &[(&str, &str, &str)]) -> Self {
        Self::new().with_rules(rules)
    }

    fn with_rules(mut self, rules: &[(&str, &str, &str)]) -> Self {
        // Built-in patterns are literals covered by tests.
        self.predicates.extend(
            rules
                .iter()
                .filter_map(|(name, pattern, reason)| NoisePredicate::new(*name, pattern, *reason).ok()),
        );
        self
    }

    /// Appends a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: NoisePredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Returns the first predicate that rejects `line`, if any.
    pub fn classify(&self, line: &str) -> Option<NoiseMatch<'_>> {
        self.predicates
            .iter()
            .find(|p| p.matches(line))
            .map(|p| NoiseMatch {
                name: &p.name,
                reason: &p.reason,
            })
    }

    pub fn is_noise(&self, line: &str) -> bool {
        self.classify(line).is_some()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_compile() {
        assert_eq!(NoiseFilter::terminal().len(), TERMINAL_RULES.len());
        assert_eq!(
            NoiseFilter::option_scan().len(),
            TERMINAL_RULES.len() + PROGRESS_RULES.len()
        );
    }

    #[test]
    fn test_token_count_is_noise() {
        let filter = NoiseFilter::terminal();
        let hit = filter.classify("1.7k tokens · thinking").unwrap();
        assert_eq!(hit.name, "token_count");
        assert_eq!(hit.reason, "token counter");
    }

    #[test]
    fn test_terminal_rules() {
        let filter = NoiseFilter::terminal();
        assert!(filter.is_noise("·•●"));
        assert!(filter.is_noise("0;✳ Claude Code"));
        assert!(filter.is_noise("✻ Pondering… (esc to interrupt)"));
        assert!(filter.is_noise("Loading project"));
        assert!(filter.is_noise("────────────"));
        assert!(filter.is_noise("(12s · thinking)"));
        assert!(!filter.is_noise("2. Yes, allow edits"));
        assert!(!filter.is_noise("Do you want to proceed?"));
    }

    #[test]
    fn test_option_scan_rejects_progress_lines() {
        let scan = NoiseFilter::option_scan();
        assert!(scan.is_noise("3. Hatching…"));
        assert!(scan.is_noise("Running..."));
        assert!(scan.is_noise("Compiling… (4s · ↓ 1.2k tokens)"));
        assert!(scan.is_noise("(↑ 320 tokens)"));
        assert!(scan.is_noise("Working on it (esc to interrupt)"));
        assert!(!NoiseFilter::terminal().is_noise("3. Hatching…"));
    }

    #[test]
    fn test_option_scan_keeps_prompt_text_with_progress_words() {
        let scan = NoiseFilter::option_scan();
        assert!(!scan.is_noise("1. Keep running"));
        assert!(!scan.is_noise("2. Yes, and don't ask again for running npm commands"));
        assert!(!scan.is_noise("Do you want to proceed with running the tests?"));
        assert!(!scan.is_noise("Limit output to 500 tokens?"));
    }

    #[test]
    fn test_custom_predicate_as_data() {
        let filter = NoiseFilter::new()
            .with_predicate(NoisePredicate::new("cost", r"^\$\d", "cost display").unwrap());
        assert_eq!(filter.classify("$0.42 spent").unwrap().name, "cost");
        assert!(filter.classify("1. Yes").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(NoisePredicate::new("bad", "(", "x").is_err());
    }
}
