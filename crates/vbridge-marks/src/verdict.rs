use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use vbridge_reports::{LeafType, ReportId, ReportTree};

use crate::association::{Association, AssociationSet};
use crate::mark::{MarkPayload, MarkStore, SafeVerdict, UnsafeVerdict};

pub const WITHOUT_MARKS: &str = "without marks";
pub const INCOMPATIBLE: &str = "incompatible marks";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "value", rename_all = "snake_case")]
pub enum Verdict {
    WithoutMarks,
    Incompatible,
    Safe(SafeVerdict),
    Unsafe(UnsafeVerdict),
    Problems(BTreeSet<String>),
}

impl Verdict {
    /// Key the verdict is counted under in a summary.
    pub fn label(&self) -> String {
        match self {
            Verdict::WithoutMarks => WITHOUT_MARKS.to_string(),
            Verdict::Incompatible => INCOMPATIBLE.to_string(),
            Verdict::Safe(v) => v.as_str().to_string(),
            Verdict::Unsafe(v) => v.as_str().to_string(),
            Verdict::Problems(p) => p.iter().cloned().collect::<Vec<_>>().join(", "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafVerdict {
    pub report: ReportId,
    pub path: String,
    pub leaf_type: LeafType,
    pub verdict: Verdict,
    /// Highest-priority association, most recently edited mark first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_mark: Option<String>,
    pub tags: BTreeSet<String>,
    pub associations: Vec<Association>,
}

/// Effective verdict of one leaf. Associations whose mark no longer exists
/// are ignored.
pub fn leaf_verdict(
    tree: &ReportTree,
    report: ReportId,
    associations: &AssociationSet,
    marks: &MarkStore,
) -> Option<LeafVerdict> {
    let leaf = tree.get(report)?;
    let leaf_type = leaf.kind.leaf_type()?;
    let mut live: Vec<(&Association, &MarkPayload, chrono::DateTime<chrono::Utc>)> = associations
        .for_report(report)
        .into_iter()
        .filter_map(|a| {
            let version = marks.get(&a.mark)?.current()?;
            Some((a, &version.payload, version.edited_at))
        })
        .collect();
    live.sort_by(|x, y| {
        y.0.kind
            .priority()
            .cmp(&x.0.kind.priority())
            .then(y.2.cmp(&x.2))
            .then(x.0.mark.cmp(&y.0.mark))
    });

    let tags: BTreeSet<String> = live
        .iter()
        .flat_map(|(_, payload, _)| payload.tags().iter().cloned())
        .collect();
    let verdict = match live.first() {
        None => Verdict::WithoutMarks,
        Some((top, _, _)) => {
            let top_priority = top.kind.priority();
            let leaders: Vec<&MarkPayload> = live
                .iter()
                .filter(|(a, _, _)| a.kind.priority() == top_priority)
                .map(|(_, p, _)| *p)
                .collect();
            match leaf_type {
                LeafType::Unknown => Verdict::Problems(
                    live.iter()
                        .filter_map(|(a, _, _)| a.problem.clone())
                        .collect(),
                ),
                LeafType::Safe => {
                    let verdicts: BTreeSet<SafeVerdict> = leaders
                        .iter()
                        .filter_map(|p| match p {
                            MarkPayload::Safe { verdict, .. } => Some(*verdict),
                            _ => None,
                        })
                        .collect();
                    single(verdicts).map(Verdict::Safe).unwrap_or(Verdict::Incompatible)
                }
                LeafType::Unsafe => {
                    let verdicts: BTreeSet<UnsafeVerdict> = leaders
                        .iter()
                        .filter_map(|p| match p {
                            MarkPayload::Unsafe { verdict, .. } => Some(*verdict),
                            _ => None,
                        })
                        .collect();
                    single(verdicts).map(Verdict::Unsafe).unwrap_or(Verdict::Incompatible)
                }
            }
        }
    };
    Some(LeafVerdict {
        report,
        path: leaf.path.clone(),
        leaf_type,
        verdict,
        primary_mark: live.first().map(|(a, _, _)| a.mark.clone()),
        tags,
        associations: live.iter().map(|(a, _, _)| (*a).clone()).collect(),
    })
}

fn single<T: Copy>(set: BTreeSet<T>) -> Option<T> {
    if set.len() == 1 {
        set.into_iter().next()
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub total: u64,
    pub verdicts: BTreeMap<String, u64>,
    pub tags: BTreeMap<String, u64>,
}

impl VerdictCounts {
    fn add(&mut self, verdict: &LeafVerdict) {
        self.total += 1;
        match &verdict.verdict {
            Verdict::Problems(problems) if !problems.is_empty() => {
                for p in problems {
                    *self.verdicts.entry(p.clone()).or_default() += 1;
                }
            }
            Verdict::Problems(_) => {
                *self.verdicts.entry(WITHOUT_MARKS.to_string()).or_default() += 1;
            }
            other => {
                *self.verdicts.entry(other.label()).or_default() += 1;
            }
        }
        for tag in &verdict.tags {
            *self.tags.entry(tag.clone()).or_default() += 1;
        }
    }
}

/// Per-verdict, per-tag and per-problem counts of the leaves under one
/// report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: String,
    pub report: String,
    pub safes: VerdictCounts,
    pub unsafes: VerdictCounts,
    pub unknowns: VerdictCounts,
}

impl JobSummary {
    /// Rolls up the subtree of `root`, or of the whole tree when `None`.
    pub fn compute(
        tree: &ReportTree,
        root: Option<ReportId>,
        associations: &AssociationSet,
        marks: &MarkStore,
    ) -> Self {
        let mut summary = JobSummary {
            job: tree.job().to_string(),
            ..Self::default()
        };
        let root = root.or_else(|| tree.root().map(|r| r.id));
        let Some(root) = root else { return summary };
        summary.report = tree.get(root).map(|r| r.path.clone()).unwrap_or_default();
        for leaf in tree.leaves_under(root) {
            let Some(v) = leaf_verdict(tree, leaf, associations, marks) else { continue };
            match v.leaf_type {
                LeafType::Safe => summary.safes.add(&v),
                LeafType::Unsafe => summary.unsafes.add(&v),
                LeafType::Unknown => summary.unknowns.add(&v),
            }
        }
        summary
    }
}
