//! Plan sanitizer
//!
//! Plans must read as business language. Model output occasionally leaks
//! identifier-shaped tokens (`hcp_id`, `sales.region`, `totalUnits`) or SQL
//! keywords; this rewrites them to plain words.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::BTreeSet;

use crate::types::PlanResult;

lazy_static! {
    static ref DOTTED_IDENT: Regex =
        Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)+\b").unwrap();
    static ref SNAKE_IDENT: Regex = Regex::new(r"\b[A-Za-z0-9]+(?:_[A-Za-z0-9]+)+\b").unwrap();
    static ref CAMEL_IDENT: Regex = Regex::new(r"\b[a-z]+(?:[A-Z][a-z0-9]*)+\b").unwrap();
    static ref SQL_KEYWORD: Regex = Regex::new(
        r"\b(SELECT|FROM|WHERE|INNER JOIN|LEFT JOIN|JOIN|GROUP BY|ORDER BY|HAVING|LIMIT|UNION|DISTINCT)\b"
    )
    .unwrap();
    static ref BACKTICKED: Regex = Regex::new(r"`([^`\n]*)`").unwrap();
    static ref CAMEL_BOUNDARY: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
    static ref SPACES: Regex = Regex::new(r"[ \t]{2,}").unwrap();
}

const MAX_PASSES: usize = 32;

/// Abbreviations such as "e.g" are dotted but not identifiers
fn is_abbreviation(token: &str) -> bool {
    token.contains('.') && token.split('.').all(|segment| segment.chars().count() <= 1)
}

/// Identifier-shaped tokens present in `text`
pub fn find_identifier_tokens(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for regex in [&*DOTTED_IDENT, &*SNAKE_IDENT, &*CAMEL_IDENT] {
        for m in regex.find_iter(text) {
            if !is_abbreviation(m.as_str()) {
                found.push(m.as_str().to_string());
            }
        }
    }
    found
}

/// `hcp_dim.TotalUnits` -> `hcp dim total units`
pub fn humanize_identifier(token: &str) -> String {
    let split = CAMEL_BOUNDARY.replace_all(token, "$1 $2");
    split
        .split(|c: char| c == '_' || c == '.' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rewrites identifier-shaped tokens and SQL keywords in plan text
#[derive(Debug, Clone, Default)]
pub struct PlanSanitizer {
    known: Option<Regex>,
}

impl PlanSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also humanize these dataset identifiers wherever they appear as whole words
    pub fn with_known_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = identifiers
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .filter(|name| name.chars().count() > 1 && humanize_identifier(name) != *name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        let known = if names.is_empty() {
            None
        } else {
            let alternation = names
                .iter()
                .map(|name| regex::escape(name))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"\b(?:{})\b", alternation)).ok()
        };
        Self { known }
    }

    pub fn sanitize_text(&self, text: &str) -> String {
        let mut current = BACKTICKED.replace_all(text, "$1").into_owned();

        for _ in 0..MAX_PASSES {
            let mut next = current.clone();
            if let Some(known) = &self.known {
                next = known
                    .replace_all(&next, |caps: &Captures| humanize_identifier(&caps[0]))
                    .into_owned();
            }
            for regex in [&*DOTTED_IDENT, &*SNAKE_IDENT, &*CAMEL_IDENT] {
                next = regex
                    .replace_all(&next, |caps: &Captures| {
                        let token = &caps[0];
                        if is_abbreviation(token) {
                            token.to_string()
                        } else {
                            humanize_identifier(token)
                        }
                    })
                    .into_owned();
            }
            next = SQL_KEYWORD
                .replace_all(&next, |caps: &Captures| caps[0].to_lowercase())
                .into_owned();

            if next == current {
                break;
            }
            current = next;
        }

        SPACES.replace_all(current.trim(), " ").into_owned()
    }

    pub fn sanitize_plan(&self, plan: PlanResult) -> PlanResult {
        PlanResult {
            intent: self.sanitize_text(&plan.intent),
            instructions: self.sanitize_text(&plan.instructions),
            output_requirements: plan
                .output_requirements
                .iter()
                .map(|req| self.sanitize_text(req))
                .filter(|req| !req.is_empty())
                .collect(),
            sort_preference: plan
                .sort_preference
                .as_deref()
                .map(|s| self.sanitize_text(s))
                .filter(|s| !s.is_empty()),
            assumptions: plan
                .assumptions
                .iter()
                .map(|a| self.sanitize_text(a))
                .collect(),
            ..plan
        }
    }
}
