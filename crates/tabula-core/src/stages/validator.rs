//! Validator stage
//!
//! Deterministic scoring of a query result against its plan. Confidence starts at
//! 1.0 and each failed check subtracts a fixed penalty. Some checks are hard
//! failures that make the result unacceptable whatever the confidence.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::Validator;
use crate::types::{PlanResult, QueryResult, ValidationResult};

const EMPTY_RESULT_PENALTY: f64 = 0.6;
const COVERAGE_PENALTY: f64 = 0.4;
const SORT_PENALTY: f64 = 0.25;
const LIMIT_PENALTY: f64 = 0.25;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "by", "each", "for", "in", "of", "on", "or", "per", "the", "to",
    "with", "its", "their",
];

const DESCENDING_HINTS: &[&str] = &[
    "desc", "descending", "highest", "largest", "most", "top", "best", "greatest", "biggest",
    "decreasing", "max",
];

const ASCENDING_HINTS: &[&str] = &[
    "asc", "ascending", "lowest", "smallest", "least", "bottom", "worst", "fewest", "increasing",
    "min", "earliest", "oldest", "alphabetical", "alphabetically",
];

/// Lowercased word stems used for fuzzy matching of requirements to columns
pub fn tokens(text: &str) -> BTreeSet<String> {
    let mut spaced = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if let Some(p) = prev {
            if (p.is_lowercase() || p.is_ascii_digit()) && c.is_uppercase() {
                spaced.push(' ');
            }
        }
        spaced.push(c);
        prev = Some(c);
    }

    spaced
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| stem(&word.to_lowercase()))
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

fn overlaps(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.intersection(b).next().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

fn sort_direction(preference: &str) -> Option<Direction> {
    let words = tokens(preference);
    let has = |hints: &[&str]| hints.iter().any(|h| words.contains(&stem(h)));
    match (has(DESCENDING_HINTS), has(ASCENDING_HINTS)) {
        (true, false) => Some(Direction::Descending),
        (false, true) => Some(Direction::Ascending),
        _ => None,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        _ => None,
    }
}

/// Validator with fixed penalties and a configurable acceptance threshold
#[derive(Debug, Clone)]
pub struct RuleValidator {
    threshold: f64,
}

impl RuleValidator {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Column index the sort preference refers to, by word overlap
    fn sort_column(preference: &str, columns: &[String]) -> Option<usize> {
        let wanted = tokens(preference);
        columns
            .iter()
            .enumerate()
            .filter(|(_, column)| overlaps(&tokens(column), &wanted))
            .map(|(idx, _)| idx)
            .last()
    }

    fn check_sort(plan: &PlanResult, result: &QueryResult) -> Option<String> {
        let preference = plan.sort_preference.as_deref()?;
        let direction = sort_direction(preference)?;
        let column = Self::sort_column(preference, &result.columns)?;

        let violated = result.rows.windows(2).any(|pair| {
            let (Some(a), Some(b)) = (pair[0].get(column), pair[1].get(column)) else {
                return false;
            };
            match (compare_values(a, b), direction) {
                (Some(Ordering::Less), Direction::Descending) => true,
                (Some(Ordering::Greater), Direction::Ascending) => true,
                _ => false,
            }
        });

        violated.then(|| {
            format!(
                "rows are not ordered as requested ({}) on `{}`",
                preference, result.columns[column]
            )
        })
    }
}

impl Default for RuleValidator {
    fn default() -> Self {
        Self::new(0.6)
    }
}

impl Validator for RuleValidator {
    fn validate(&self, plan: &PlanResult, result: &QueryResult) -> ValidationResult {
        if let Some(error) = &result.execution_error {
            return ValidationResult {
                confidence: 0.0,
                is_acceptable: false,
                issues: vec![format!("the statement failed to execute: {}", error)],
                hard_failure: true,
            };
        }
        if result.statement.trim().is_empty() {
            return ValidationResult {
                confidence: 0.0,
                is_acceptable: false,
                issues: vec!["no statement was produced".to_string()],
                hard_failure: true,
            };
        }

        let mut confidence: f64 = 1.0;
        let mut issues = Vec::new();
        let mut hard_failure = false;

        if result.rows.is_empty() && plan.expects_results {
            confidence -= EMPTY_RESULT_PENALTY;
            hard_failure = true;
            issues.push("the query returned no rows, but the question expects results".to_string());
        }

        if !plan.output_requirements.is_empty() {
            if result.columns.is_empty() {
                confidence -= COVERAGE_PENALTY;
                hard_failure = true;
                issues.push("the result has no columns".to_string());
            } else {
                let column_tokens: Vec<BTreeSet<String>> =
                    result.columns.iter().map(|c| tokens(c)).collect();
                let missing: Vec<&String> = plan
                    .output_requirements
                    .iter()
                    .filter(|req| {
                        let wanted = tokens(req);
                        !wanted.is_empty() && !column_tokens.iter().any(|c| overlaps(c, &wanted))
                    })
                    .collect();

                if !missing.is_empty() {
                    let fraction = missing.len() as f64 / plan.output_requirements.len() as f64;
                    confidence -= COVERAGE_PENALTY * fraction;
                    hard_failure = true;
                    for req in missing {
                        issues.push(format!("no column appears to provide \"{}\"", req));
                    }
                }
            }
        }

        if let Some(issue) = Self::check_sort(plan, result) {
            confidence -= SORT_PENALTY;
            issues.push(issue);
        }

        if let Some(limit) = plan.limit_preference {
            if result.rows.len() > limit as usize {
                confidence -= LIMIT_PENALTY;
                issues.push(format!(
                    "returned {} rows but at most {} were requested",
                    result.rows.len(),
                    limit
                ));
            }
        }

        let confidence = confidence.clamp(0.0, 1.0);
        ValidationResult {
            confidence,
            is_acceptable: !hard_failure && confidence >= self.threshold,
            issues,
            hard_failure,
        }
    }
}
