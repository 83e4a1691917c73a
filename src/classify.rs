//! Severity classification of untagged engine text.
//!
//! The catalogue of error and warning phrases depends on the engine version,
//! so it is plain data: an ordered list of rules, first match wins.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::events::Severity;

/// How a rule's pattern is compared against a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Contains,
    StartsWith,
    Regex,
}

/// One entry of the classification catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRule {
    pub kind: MatchKind,
    pub pattern: String,
    pub severity: Severity,
}

impl TextRule {
    pub fn new(kind: MatchKind, pattern: &str, severity: Severity) -> Self {
        Self {
            kind,
            pattern: pattern.to_string(),
            severity,
        }
    }
}

/// The built-in catalogue. Not authoritative; replace it through the config.
pub fn default_text_rules() -> Vec<TextRule> {
    use MatchKind as K;
    use Severity as S;
    vec![
        TextRule::new(K::Contains, "incorrect syntax", S::Error),
        TextRule::new(K::Contains, "-- an error.", S::Error),
        TextRule::new(K::Contains, "Maxima encountered a Lisp error", S::Error),
        TextRule::new(K::Contains, "Console interrupt", S::Error),
        TextRule::new(K::Contains, "Entering a Lisp break loop", S::Error),
        TextRule::new(K::Contains, "debugmode", S::Error),
        TextRule::new(K::StartsWith, "(dbm:", S::Error),
        TextRule::new(K::Regex, r"^gnuplot>", S::Error),
        TextRule::new(K::Regex, r"line \d+: ", S::Error),
        TextRule::new(K::StartsWith, "Warning:", S::Warning),
        TextRule::new(K::StartsWith, "WARNING:", S::Warning),
        TextRule::new(K::Contains, "rat: replaced", S::Warning),
        TextRule::new(K::Contains, "is deprecated", S::Warning),
    ]
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    StartsWith(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Contains(pattern) => line.contains(pattern.as_str()),
            Matcher::StartsWith(pattern) => line.starts_with(pattern.as_str()),
            Matcher::Regex(regex) => regex.is_match(line),
        }
    }
}

/// Compiled catalogue
#[derive(Debug, Clone)]
pub struct TextClassifier {
    rules: Vec<(Matcher, Severity)>,
}

impl TextClassifier {
    pub fn new(rules: &[TextRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let matcher = match rule.kind {
                    MatchKind::Contains => Matcher::Contains(rule.pattern.clone()),
                    MatchKind::StartsWith => Matcher::StartsWith(rule.pattern.clone()),
                    MatchKind::Regex => Matcher::Regex(Regex::new(&rule.pattern).map_err(|e| {
                        SessionError::Config(format!("text rule '{}': {}", rule.pattern, e))
                    })?),
                };
                Ok((matcher, rule.severity))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Severity of the first matching rule, or `Default`
    pub fn classify(&self, line: &str) -> Severity {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(line))
            .map(|(_, severity)| *severity)
            .unwrap_or_default()
    }
}

/// Collapse whitespace runs into single spaces and trim the ends
pub fn normalize_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}
