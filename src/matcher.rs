/// Line matching over captured console output.
///
/// Every pattern is anchored at the start of a line (but not at its end), and
/// when several lines match the most recently emitted one wins.
use crate::error::HarnessError;
use regex::Regex;

/// A regular expression evaluated against the start of a console line.
#[derive(Debug, Clone)]
pub struct LinePattern {
    source: String,
    regex: Regex,
}

impl LinePattern {
    pub fn new(pattern: &str) -> Result<Self, HarnessError> {
        let regex =
            Regex::new(&format!("^(?:{pattern})")).map_err(|e| HarnessError::Pattern {
                pattern: pattern.to_string(),
                source: e,
            })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written, without the added anchor.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Compile a list of patterns, failing on the first invalid one.
pub fn compile(patterns: &[&str]) -> Result<Vec<LinePattern>, HarnessError> {
    patterns.iter().map(|p| LinePattern::new(p)).collect()
}

/// Source text of each pattern, for reporting.
pub fn describe(patterns: &[LinePattern]) -> Vec<String> {
    patterns.iter().map(|p| p.as_str().to_string()).collect()
}

/// A line that satisfied at least one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub index: usize,
    pub line: String,
}

/// Every line matching any pattern, in emission order.
pub fn find_all(lines: &[&str], patterns: &[LinePattern]) -> Vec<MatchResult> {
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| patterns.iter().any(|p| p.is_match(line)))
        .map(|(index, line)| MatchResult {
            index,
            line: line.to_string(),
        })
        .collect()
}

/// The highest-indexed line matching any pattern.
pub fn find_latest(lines: &[&str], patterns: &[LinePattern]) -> Option<MatchResult> {
    lines
        .iter()
        .enumerate()
        .rev()
        .find(|(_, line)| patterns.iter().any(|p| p.is_match(line)))
        .map(|(index, line)| MatchResult {
            index,
            line: line.to_string(),
        })
}
