use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::convert::ConvertedTrace;
use crate::TraceError;

/// How a mark's converted trace is scored against a report's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ComparisonFunction {
    Equal,
    /// Mark sequence appears contiguously in the report sequence.
    Include,
    /// Like `Include`, anchored at the end of the report (the error point).
    IncludeWithErrorLocation,
    /// Fraction of mark elements found in the report, counted as a multiset.
    IncludeAll,
    /// Longest common subsequence over the mark length.
    IncludeAllOrdered,
    /// Always matches; conversion is not even attempted.
    Skip,
}

impl ComparisonFunction {
    pub const ALL: [ComparisonFunction; 6] = [
        ComparisonFunction::Equal,
        ComparisonFunction::Include,
        ComparisonFunction::IncludeWithErrorLocation,
        ComparisonFunction::IncludeAll,
        ComparisonFunction::IncludeAllOrdered,
        ComparisonFunction::Skip,
    ];

    pub fn id(self) -> u8 {
        match self {
            ComparisonFunction::Equal => 0,
            ComparisonFunction::Include => 1,
            ComparisonFunction::IncludeWithErrorLocation => 2,
            ComparisonFunction::IncludeAll => 3,
            ComparisonFunction::IncludeAllOrdered => 4,
            ComparisonFunction::Skip => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ComparisonFunction::Equal => "equal",
            ComparisonFunction::Include => "include",
            ComparisonFunction::IncludeWithErrorLocation => "include_with_error",
            ComparisonFunction::IncludeAll => "include_all",
            ComparisonFunction::IncludeAllOrdered => "include_all_ordered",
            ComparisonFunction::Skip => "skip",
        }
    }
}

impl Default for ComparisonFunction {
    fn default() -> Self {
        ComparisonFunction::Equal
    }
}

impl TryFrom<u8> for ComparisonFunction {
    type Error = TraceError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        ComparisonFunction::ALL
            .into_iter()
            .find(|f| f.id() == id)
            .ok_or(TraceError::UnknownComparison(id))
    }
}

impl From<ComparisonFunction> for u8 {
    fn from(f: ComparisonFunction) -> u8 {
        f.id()
    }
}

pub fn validate_threshold(threshold: f64) -> Result<f64, TraceError> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(TraceError::InvalidThreshold(threshold.to_string()))
    }
}

/// Similarity in [0, 1]. An empty mark sequence is included in anything.
pub fn similarity(function: ComparisonFunction, mark: &ConvertedTrace, report: &ConvertedTrace) -> f64 {
    let m = mark.elements();
    let r = report.elements();
    match function {
        ComparisonFunction::Skip => 1.0,
        ComparisonFunction::Equal => bool_score(m == r),
        ComparisonFunction::Include => {
            bool_score(m.is_empty() || r.windows(m.len()).any(|w| w == m))
        }
        ComparisonFunction::IncludeWithErrorLocation => bool_score(r.ends_with(m)),
        ComparisonFunction::IncludeAll => {
            if m.is_empty() {
                return 1.0;
            }
            let mut available: HashMap<&str, usize> = HashMap::new();
            for e in r {
                *available.entry(e.as_str()).or_default() += 1;
            }
            let mut found = 0usize;
            for e in m {
                if let Some(n) = available.get_mut(e.as_str()) {
                    if *n > 0 {
                        *n -= 1;
                        found += 1;
                    }
                }
            }
            found as f64 / m.len() as f64
        }
        ComparisonFunction::IncludeAllOrdered => {
            if m.is_empty() {
                return 1.0;
            }
            lcs_len(m, r) as f64 / m.len() as f64
        }
    }
}

pub fn is_match(similarity: f64, threshold: f64) -> bool {
    similarity >= threshold
}

fn bool_score(hit: bool) -> f64 {
    if hit {
        1.0
    } else {
        0.0
    }
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; a.len() + 1];
    let mut cur = vec![0usize; a.len() + 1];
    for y in b {
        for (i, x) in a.iter().enumerate() {
            cur[i + 1] = if x == y {
                prev[i] + 1
            } else {
                cur[i].max(prev[i + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[a.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::sample_trace;
    use crate::{convert, convert_raw, ConversionFunction, ErrorTrace};

    fn seq(items: &[&str]) -> ConvertedTrace {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_and_include() {
        let report = seq(&["a", "b", "c", "d"]);
        assert_eq!(similarity(ComparisonFunction::Equal, &report, &report), 1.0);
        assert_eq!(similarity(ComparisonFunction::Equal, &seq(&["a"]), &report), 0.0);
        assert_eq!(similarity(ComparisonFunction::Include, &seq(&["b", "c"]), &report), 1.0);
        assert_eq!(similarity(ComparisonFunction::Include, &seq(&["b", "d"]), &report), 0.0);
        assert_eq!(similarity(ComparisonFunction::Include, &seq(&[]), &report), 1.0);
    }

    #[test]
    fn include_with_error_location_is_anchored_at_the_end() {
        let report = seq(&["a", "b", "c"]);
        let f = ComparisonFunction::IncludeWithErrorLocation;
        assert_eq!(similarity(f, &seq(&["b", "c"]), &report), 1.0);
        assert_eq!(similarity(f, &seq(&["a", "b"]), &report), 0.0);
    }

    #[test]
    fn fractional_scores_and_threshold_boundary() {
        let report = seq(&["a", "b", "c", "x"]);
        let mark = seq(&["a", "b", "c", "d"]);
        let all = similarity(ComparisonFunction::IncludeAll, &mark, &report);
        assert_eq!(all, 0.75);
        assert!(is_match(all, 0.75));
        assert!(!is_match(all, 0.76));

        let ordered = similarity(ComparisonFunction::IncludeAllOrdered, &seq(&["c", "a", "b"]), &report);
        assert!((ordered - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn include_all_counts_duplicates() {
        let report = seq(&["a", "b"]);
        let mark = seq(&["a", "a"]);
        assert_eq!(similarity(ComparisonFunction::IncludeAll, &mark, &report), 0.5);
    }

    #[test]
    fn call_tree_mark_stops_matching_after_rename() {
        let original = serde_json::to_vec(&sample_trace()).expect("bytes");
        let trace = ErrorTrace::from_slice(&original).expect("trace");
        let mark = convert(&trace, ConversionFunction::CallTree);

        let report = convert_raw(&original, ConversionFunction::CallTree).expect("convert");
        assert_eq!(similarity(ComparisonFunction::Equal, &mark, &report), 1.0);

        let mut renamed = sample_trace();
        renamed["funcs"][1] = serde_json::json!("init_v2");
        let renamed = serde_json::to_vec(&renamed).expect("bytes");
        let report = convert_raw(&renamed, ConversionFunction::CallTree).expect("convert");
        assert_eq!(similarity(ComparisonFunction::Equal, &mark, &report), 0.0);
    }

    #[test]
    fn thresholds_outside_unit_interval_are_rejected() {
        assert_eq!(validate_threshold(0.5), Ok(0.5));
        assert!(validate_threshold(1.5).is_err());
        assert!(validate_threshold(f64::NAN).is_err());
    }
}
