use regex::{Captures, Regex};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::mark::{AttrOperator, AttrPattern};
use crate::MarkError;

/// Compiled attribute conditions of one mark version.
#[derive(Debug)]
pub struct AttrFilter {
    patterns: Vec<(AttrPattern, Option<Regex>)>,
}

impl AttrFilter {
    pub fn compile(patterns: &[AttrPattern]) -> Result<Self, MarkError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let re = match p.op {
                    AttrOperator::Re => Some(Regex::new(&p.value).map_err(|e| {
                        MarkError::Invalid(format!("attribute '{}': {}", p.attr, e))
                    })?),
                    _ => None,
                };
                Ok((p.clone(), re))
            })
            .collect::<Result<Vec<_>, MarkError>>()?;
        Ok(Self { patterns })
    }

    /// A present attribute must satisfy its pattern. An absent one only
    /// rejects when the pattern is a comparison attribute.
    pub fn matches(&self, attrs: &BTreeMap<String, String>) -> bool {
        self.patterns.iter().all(|(pattern, re)| match attrs.get(&pattern.attr) {
            Some(actual) => check(pattern, re.as_ref(), actual),
            None => !pattern.is_compare,
        })
    }
}

fn check(pattern: &AttrPattern, re: Option<&Regex>, actual: &str) -> bool {
    let expected = pattern.value.as_str();
    match pattern.op {
        AttrOperator::Eq => actual == expected,
        AttrOperator::Ne => actual != expected,
        AttrOperator::Re => re.map(|r| r.is_match(actual)).unwrap_or(false),
        AttrOperator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        AttrOperator::Le => matches!(ordering(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        AttrOperator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        AttrOperator::Ge => matches!(ordering(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Numeric when both sides parse as numbers, lexicographic otherwise.
fn ordering(actual: &str, expected: &str) -> Option<Ordering> {
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    }
}

const PLACEHOLDER: &str = r"\{(\d+)\}";

/// Problem matcher of an unknown mark.
#[derive(Debug)]
pub struct ProblemMatcher {
    function: String,
    problem: String,
    regex: Option<(Regex, Regex)>,
}

impl ProblemMatcher {
    pub fn compile(function: &str, problem: &str, is_regexp: bool) -> Result<Self, MarkError> {
        if function.is_empty() {
            return Err(MarkError::Invalid("unknown mark function is empty".to_string()));
        }
        let regex = if is_regexp {
            let re = Regex::new(function)
                .map_err(|e| MarkError::Invalid(format!("function pattern: {}", e)))?;
            let placeholder = Regex::new(PLACEHOLDER)
                .map_err(|e| MarkError::Invalid(format!("problem pattern: {}", e)))?;
            Some((re, placeholder))
        } else {
            None
        };
        Ok(Self {
            function: function.to_string(),
            problem: problem.to_string(),
            regex,
        })
    }

    /// Problem label for `text`, or `None` when the function does not match.
    /// `{0}`, `{1}`… in the problem pattern take the regex capture groups in
    /// one pass; group text is never rescanned. A placeholder past the last
    /// group is kept as written.
    pub fn label(&self, text: &str) -> Option<String> {
        match &self.regex {
            None => text.contains(&self.function).then(|| self.problem.clone()),
            Some((re, placeholder)) => {
                let caps = re.captures(text)?;
                let label = placeholder.replace_all(&self.problem, |p: &Captures<'_>| {
                    let group = p[1]
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| i.checked_add(1))
                        .filter(|i| *i < caps.len());
                    match group {
                        Some(i) => caps.get(i).map(|m| m.as_str()).unwrap_or("").to_string(),
                        None => p[0].to_string(),
                    }
                });
                Some(label.into_owned())
            }
        }
    }
}
