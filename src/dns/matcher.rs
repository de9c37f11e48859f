use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("Invalid bypass pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("Failed to compile bypass patterns: {0}")]
    CompileError(#[from] regex::Error),
}

/// Decides which query names have their answers bypass the VPN.
///
/// Patterns are case-insensitive regular expressions matched anywhere in the
/// name, so `google` matches `www.google.com` while `(^|\.)ink\.com$` only
/// matches `ink.com` and its subdomains.
#[derive(Debug, Clone)]
pub struct BypassMatcher {
    pattern: Option<Regex>,
    count: usize,
}

impl BypassMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, MatcherError> {
        let patterns: Vec<&str> = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .collect();

        // Check each pattern alone so errors name the offending entry
        for pattern in &patterns {
            Regex::new(pattern).map_err(|source| MatcherError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        }

        if patterns.is_empty() {
            return Ok(Self {
                pattern: None,
                count: 0,
            });
        }

        let alternation = patterns
            .iter()
            .map(|p| format!("(?:{})", p))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            pattern: Some(pattern),
            count: patterns.len(),
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        let name = name.strip_suffix('.').unwrap_or(name);
        self.pattern.as_ref().is_some_and(|p| p.is_match(name))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
