//! Project selection: include/exclude patterns over project ids.
//!
//! Patterns are shell-style: `*` matches any run of characters, `?` matches
//! exactly one. An empty include list selects every project; excludes are
//! applied after includes.

use regex::Regex;

use crate::core::errors::{AuditError, Result};

/// Compiled include/exclude project filter.
#[derive(Debug, Clone)]
pub struct ProjectFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl ProjectFilter {
    /// Compile the given pattern lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include
                .iter()
                .map(|p| glob_to_regex(p))
                .collect::<Result<_>>()?,
            exclude: exclude
                .iter()
                .map(|p| glob_to_regex(p))
                .collect::<Result<_>>()?,
        })
    }

    /// Filter that admits every project.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    #[must_use]
    pub fn admits(&self, project_id: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|re| re.is_match(project_id));
        included && !self.exclude.iter().any(|re| re.is_match(project_id))
    }

    /// Keep admitted projects, dropping duplicates while preserving order.
    #[must_use]
    pub fn apply(&self, projects: Vec<String>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        projects
            .into_iter()
            .filter(|p| self.admits(p) && seen.insert(p.clone()))
            .collect()
    }
}

/// Validate one pattern without keeping the compiled form.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    glob_to_regex(pattern).map(|_| ())
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(AuditError::InvalidConfig {
            details: "project pattern must not be empty".to_string(),
        });
    }

    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');
    for c in pattern.trim().chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            c => regex_str.push(c),
        }
    }
    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| AuditError::InvalidConfig {
        details: format!("invalid project pattern {pattern:?}: {err}"),
    })
}
