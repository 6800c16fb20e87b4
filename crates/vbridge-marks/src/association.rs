use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};
use vbridge_core::{BlobHandle, BlobStore, BridgeError};
use vbridge_reports::{AttrStore, ReportId, ReportKind, ReportTree};
use vbridge_trace::{
    convert_raw, is_match, similarity, ComparisonFunction, ConversionFunction, ConvertedTrace,
};

use crate::filter::{AttrFilter, ProblemMatcher};
use crate::mark::{Mark, MarkPayload, MarkStore};
use crate::MarkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationKind {
    Automatic,
    Confirmed,
    Unconfirmed,
}

impl AssociationKind {
    pub fn priority(self) -> u8 {
        match self {
            AssociationKind::Confirmed => 2,
            AssociationKind::Unconfirmed => 1,
            AssociationKind::Automatic => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub mark: String,
    pub report: ReportId,
    pub kind: AssociationKind,
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Associations of one job, at most one per (mark, report) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Association>", into = "Vec<Association>")]
pub struct AssociationSet {
    entries: BTreeMap<(String, ReportId), Association>,
}

impl From<Vec<Association>> for AssociationSet {
    fn from(list: Vec<Association>) -> Self {
        Self {
            entries: list
                .into_iter()
                .map(|a| ((a.mark.clone(), a.report), a))
                .collect(),
        }
    }
}

impl From<AssociationSet> for Vec<Association> {
    fn from(set: AssociationSet) -> Self {
        set.entries.into_values().collect()
    }
}

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, mark: &str, report: ReportId) -> Option<&Association> {
        self.entries.get(&(mark.to_string(), report))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Association> {
        self.entries.values()
    }

    pub fn for_report(&self, report: ReportId) -> Vec<&Association> {
        self.entries.values().filter(|a| a.report == report).collect()
    }

    /// Operator override of an existing association.
    pub fn set_kind(
        &mut self,
        mark: &str,
        report: ReportId,
        kind: AssociationKind,
    ) -> Result<&Association, MarkError> {
        let entry = self
            .entries
            .get_mut(&(mark.to_string(), report))
            .ok_or_else(|| MarkError::NoAssociation {
                mark: mark.to_string(),
                report: report.0,
            })?;
        entry.kind = kind;
        entry.updated_at = Utc::now();
        Ok(entry)
    }

    pub fn clear(&mut self, mark: &str, report: ReportId) -> Result<Association, MarkError> {
        self.entries
            .remove(&(mark.to_string(), report))
            .ok_or_else(|| MarkError::NoAssociation {
                mark: mark.to_string(),
                report: report.0,
            })
    }

    pub fn remove_mark(&mut self, mark: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(m, _), _| m != mark);
        before - self.entries.len()
    }
}

/// Which side of the association matrix changed.
#[derive(Debug, Clone, Copy)]
pub enum ConnectScope<'a> {
    Marks(&'a [String]),
    Reports(&'a [ReportId]),
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectStats {
    pub pairs: usize,
    pub created: usize,
    pub refreshed: usize,
    pub removed: usize,
    pub errors: usize,
}

type TraceCache = HashMap<(String, ConversionFunction), ConvertedTrace>;

/// Matches marks against leaves. Converted report traces are cached per job
/// by `(trace_id, conversion)`; a job's entries live until its tree is
/// dropped with [`AssociationEngine::forget_job`].
#[derive(Debug, Default)]
pub struct AssociationEngine {
    cache: Mutex<HashMap<String, TraceCache>>,
}

struct CompiledMark<'a> {
    mark: &'a Mark,
    filter: AttrFilter,
    problem: Option<ProblemMatcher>,
}

impl AssociationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_traces(&self) -> usize {
        self.cache.lock().values().map(HashMap::len).sum()
    }

    /// Drops the converted traces of `job`, whose tree is being replaced.
    pub fn forget_job(&self, job: &str) {
        if let Some(traces) = self.cache.lock().remove(job) {
            debug!(job, traces = traces.len(), "trace cache dropped");
        }
    }

    /// Recomputes automatic associations of one job for `scope`. Confirmed
    /// and unconfirmed associations are never changed here. Running it twice
    /// with nothing changed in between leaves the set as it was.
    pub fn connect(
        &self,
        tree: &ReportTree,
        attrs: &AttrStore,
        marks: &MarkStore,
        blobs: &dyn BlobStore,
        associations: &mut AssociationSet,
        scope: ConnectScope<'_>,
    ) -> ConnectStats {
        let now = Utc::now();
        let mut stats = ConnectStats::default();

        let leaves: Vec<ReportId> = match scope {
            ConnectScope::Reports(ids) => ids
                .iter()
                .copied()
                .filter(|id| tree.get(*id).map(|r| r.kind.is_leaf()).unwrap_or(false))
                .collect(),
            _ => tree.leaves().map(|r| r.id).collect(),
        };
        let scoped_marks: Option<BTreeSet<&str>> = match scope {
            ConnectScope::Marks(ids) => Some(ids.iter().map(String::as_str).collect()),
            _ => None,
        };
        if let Some(ids) = &scoped_marks {
            for id in ids.iter().filter(|id| marks.get(id).is_none()) {
                stats.removed += associations.remove_mark(id);
            }
        }

        let compiled: Vec<CompiledMark<'_>> = marks
            .iter()
            .filter(|m| {
                scoped_marks
                    .as_ref()
                    .map(|s| s.contains(m.identifier.as_str()))
                    .unwrap_or(true)
            })
            .filter_map(|mark| match compile_mark(mark) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(mark = %mark.identifier, error = %e, "mark skipped");
                    stats.errors += 1;
                    None
                }
            })
            .collect();

        let mut accepted: BTreeMap<(String, ReportId), (f64, Option<String>)> = BTreeMap::new();
        for leaf_id in &leaves {
            let Some(leaf) = tree.get(*leaf_id) else { continue };
            let Some(leaf_type) = leaf.kind.leaf_type() else { continue };
            let leaf_attrs = tree.associate_attrs(*leaf_id, attrs);
            for cm in compiled.iter().filter(|c| c.mark.mark_type == leaf_type) {
                stats.pairs += 1;
                if !cm.filter.matches(&leaf_attrs) {
                    continue;
                }
                match self.evaluate(tree.job(), cm, &leaf.kind, blobs) {
                    Ok(Some(hit)) => {
                        debug!(mark = %cm.mark.identifier, report = %leaf.path, similarity = hit.0, "pair accepted");
                        accepted.insert((cm.mark.identifier.clone(), *leaf_id), hit);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(mark = %cm.mark.identifier, report = %leaf.path, error = %e, "pair rejected");
                        stats.errors += 1;
                    }
                }
            }
        }

        let in_scope = |mark: &str, report: ReportId| match scope {
            ConnectScope::Marks(_) => scoped_marks
                .as_ref()
                .map(|s| s.contains(mark))
                .unwrap_or(false),
            ConnectScope::Reports(ids) => ids.contains(&report),
            ConnectScope::All => true,
        };
        let stale: Vec<(String, ReportId)> = associations
            .entries
            .iter()
            .filter(|(key, a)| {
                a.kind == AssociationKind::Automatic
                    && in_scope(&key.0, key.1)
                    && !accepted.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            associations.entries.remove(&key);
            stats.removed += 1;
        }

        for ((mark, report), (sim, problem)) in accepted {
            let key = (mark.clone(), report);
            match associations.entries.get_mut(&key) {
                Some(existing) if existing.kind != AssociationKind::Automatic => {}
                Some(existing) => {
                    if existing.similarity != sim || existing.problem != problem {
                        existing.similarity = sim;
                        existing.problem = problem;
                        existing.updated_at = now;
                        stats.refreshed += 1;
                    }
                }
                None => {
                    associations.entries.insert(
                        key,
                        Association {
                            mark,
                            report,
                            kind: AssociationKind::Automatic,
                            similarity: sim,
                            problem,
                            updated_at: now,
                        },
                    );
                    stats.created += 1;
                }
            }
        }

        info!(
            job = tree.job(),
            pairs = stats.pairs,
            created = stats.created,
            removed = stats.removed,
            "associations recomputed"
        );
        stats
    }

    fn evaluate(
        &self,
        job: &str,
        cm: &CompiledMark<'_>,
        leaf: &ReportKind,
        blobs: &dyn BlobStore,
    ) -> Result<Option<(f64, Option<String>)>, BridgeError> {
        let Some(version) = cm.mark.current() else { return Ok(None) };
        match (&version.payload, leaf) {
            (MarkPayload::Safe { .. }, ReportKind::Safe { .. }) => Ok(Some((1.0, None))),
            (
                MarkPayload::Unsafe {
                    conversion,
                    comparison,
                    threshold,
                    error_trace,
                    ..
                },
                ReportKind::Unsafe {
                    trace_id,
                    error_trace: blob,
                    ..
                },
            ) => {
                if *comparison == ComparisonFunction::Skip {
                    return Ok(Some((1.0, None)));
                }
                let report = self.converted(job, trace_id, blob, *conversion, blobs)?;
                let score = similarity(*comparison, error_trace, &report);
                Ok(is_match(score, *threshold).then_some((score, None)))
            }
            (MarkPayload::Unknown { .. }, ReportKind::Unknown { problem_text, .. }) => Ok(cm
                .problem
                .as_ref()
                .and_then(|p| p.label(problem_text))
                .map(|label| (1.0, Some(label)))),
            _ => Ok(None),
        }
    }

    fn converted(
        &self,
        job: &str,
        trace_id: &str,
        blob: &BlobHandle,
        conversion: ConversionFunction,
        blobs: &dyn BlobStore,
    ) -> Result<ConvertedTrace, BridgeError> {
        let key = (trace_id.to_string(), conversion);
        if let Some(hit) = self.cache.lock().get(job).and_then(|c| c.get(&key)) {
            return Ok(hit.clone());
        }
        let bytes = blobs.read(blob)?;
        let converted = convert_raw(&bytes, conversion)
            .map_err(|e| BridgeError::Comparison(format!("{}: {}", trace_id, e)))?;
        self.cache
            .lock()
            .entry(job.to_string())
            .or_default()
            .insert(key, converted.clone());
        Ok(converted)
    }
}

fn compile_mark(mark: &Mark) -> Result<CompiledMark<'_>, MarkError> {
    let version = mark
        .current()
        .ok_or_else(|| MarkError::Invalid(format!("mark '{}' has no versions", mark.identifier)))?;
    let filter = AttrFilter::compile(&version.attrs)?;
    let problem = match &version.payload {
        MarkPayload::Unknown {
            function,
            problem,
            is_regexp,
            ..
        } => Some(ProblemMatcher::compile(function, problem, *is_regexp)?),
        _ => None,
    };
    Ok(CompiledMark {
        mark,
        filter,
        problem,
    })
}
