use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use vbridge_core::{
    read_archive_entry, sha256_bytes, ArchiveResolver, BlobHandle, BlobStore, BridgeError,
    IngestionError, ERROR_TRACE_FILE, LOG_FILE, PROBLEM_DESC_FILE, PROOF_FILE,
};

use crate::attrs::{normalize_attrs, AttrStore, NormalizedAttr, ReportAttr};
use crate::event::{
    AttrsEvent, CoverageEvent, CoverageSpec, DataEvent, FinishEvent, ReportEvent, Resources,
    SafeEvent, StartEvent, UnknownEvent, UnsafeEvent,
};
use crate::status::JobStatus;
use crate::ROOT_PATH;

/// Position of a report in its job's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafType {
    Safe,
    Unsafe,
    Unknown,
}

impl LeafType {
    pub fn as_str(self) -> &'static str {
        match self {
            LeafType::Safe => "safe",
            LeafType::Unsafe => "unsafe",
            LeafType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentData {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<BlobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_input: Option<BlobHandle>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub coverage: BTreeMap<String, BlobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportKind {
    Component(ComponentData),
    Verification(ComponentData),
    Safe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proof: Option<BlobHandle>,
    },
    Unsafe {
        trace_id: String,
        error_trace: BlobHandle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<BlobHandle>,
    },
    Unknown {
        problem: BlobHandle,
        problem_text: String,
    },
}

impl ReportKind {
    pub fn leaf_type(&self) -> Option<LeafType> {
        match self {
            ReportKind::Safe { .. } => Some(LeafType::Safe),
            ReportKind::Unsafe { .. } => Some(LeafType::Unsafe),
            ReportKind::Unknown { .. } => Some(LeafType::Unknown),
            ReportKind::Component(_) | ReportKind::Verification(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf_type().is_some()
    }

    pub fn component(&self) -> Option<&ComponentData> {
        match self {
            ReportKind::Component(c) | ReportKind::Verification(c) => Some(c),
            _ => None,
        }
    }

    fn component_mut(&mut self) -> Option<&mut ComponentData> {
        match self {
            ReportKind::Component(c) | ReportKind::Verification(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub path: String,
    pub parent: Option<ReportId>,
    #[serde(default)]
    pub children: Vec<ReportId>,
    #[serde(default)]
    pub attrs: Vec<ReportAttr>,
    pub kind: ReportKind,
}

impl Report {
    pub fn is_open(&self) -> bool {
        self.kind
            .component()
            .map(|c| c.finished_at.is_none())
            .unwrap_or(false)
    }
}

/// Everything an event needs from outside the tree. The attribute table is
/// shared by all jobs; it is locked only to check and intern names, never
/// across archive reads or blob writes.
pub struct ApplyContext<'a> {
    pub resolver: &'a dyn ArchiveResolver,
    pub blobs: &'a dyn BlobStore,
    pub attrs: &'a RwLock<AttrStore>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub report: Option<ReportId>,
    /// Leaves created by the event.
    pub new_leaves: Vec<ReportId>,
    /// Existing leaves whose inherited attributes changed.
    pub touched_leaves: Vec<ReportId>,
    /// Reports closed because an ancestor was finished.
    pub forced: Vec<ReportId>,
    pub status_change: Option<JobStatus>,
}

impl ApplyOutcome {
    fn for_report(id: ReportId) -> Self {
        Self {
            report: Some(id),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct TreeState {
    job: String,
    reports: Vec<Report>,
    #[serde(default)]
    open: Vec<ReportId>,
}

/// Report tree of one decision attempt. Reports live in an arena; `open`
/// holds unfinished Component/Verification reports in opening order, so a
/// report always sits after its open ancestors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TreeState")]
pub struct ReportTree {
    job: String,
    reports: Vec<Report>,
    open: Vec<ReportId>,
    #[serde(skip)]
    by_path: HashMap<String, ReportId>,
}

impl From<TreeState> for ReportTree {
    fn from(state: TreeState) -> Self {
        let by_path = state
            .reports
            .iter()
            .map(|r| (r.path.clone(), r.id))
            .collect();
        Self {
            job: state.job,
            reports: state.reports,
            open: state.open,
            by_path,
        }
    }
}

impl ReportTree {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            reports: Vec::new(),
            open: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn root(&self) -> Option<&Report> {
        self.reports.first().filter(|r| r.path == ROOT_PATH)
    }

    pub fn get(&self, id: ReportId) -> Option<&Report> {
        self.reports.get(id.0)
    }

    pub fn find(&self, path: &str) -> Option<&Report> {
        self.by_path.get(path).and_then(|id| self.get(*id))
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter()
    }

    pub fn open_reports(&self) -> &[ReportId] {
        &self.open
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter().filter(|r| r.kind.is_leaf())
    }

    pub fn is_root_open(&self) -> bool {
        self.root().map(Report::is_open).unwrap_or(false)
    }

    /// Parent chain of `id`, nearest first.
    pub fn ancestors(&self, id: ReportId) -> Vec<ReportId> {
        let mut out = Vec::new();
        let mut cur = self.get(id).and_then(|r| r.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.get(p).and_then(|r| r.parent);
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: ReportId, id: ReportId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// `id` and everything below it, pre-order.
    pub fn subtree(&self, id: ReportId) -> Vec<ReportId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(report) = self.get(cur) {
                out.push(cur);
                stack.extend(report.children.iter().rev().copied());
            }
        }
        out
    }

    pub fn leaves_under(&self, id: ReportId) -> Vec<ReportId> {
        self.subtree(id)
            .into_iter()
            .filter(|r| self.get(*r).map(|r| r.kind.is_leaf()).unwrap_or(false))
            .collect()
    }

    /// Associable attributes seen by a report: its ancestors' first, its own
    /// last, a nearer report overriding a farther one.
    pub fn associate_attrs(&self, id: ReportId, store: &AttrStore) -> BTreeMap<String, String> {
        let mut chain = self.ancestors(id);
        chain.reverse();
        chain.push(id);
        let mut out = BTreeMap::new();
        for rid in chain {
            let Some(report) = self.get(rid) else { continue };
            for attr in report.attrs.iter().filter(|a| a.associate) {
                if let Some((name, value)) = store.get(attr.attr) {
                    out.insert(name.to_string(), value.to_string());
                }
            }
        }
        out
    }

    /// True when the root was closed by a failure cascade or carries a
    /// failure leaf directly.
    pub fn root_failed(&self) -> bool {
        let Some(root) = self.root() else { return false };
        let flagged = root.kind.component().map(|c| c.failed).unwrap_or(false);
        flagged
            || root.children.iter().any(|c| {
                self.get(*c)
                    .map(|r| matches!(r.kind, ReportKind::Unknown { .. }))
                    .unwrap_or(false)
            })
    }

    /// Applies one event. Validation, archive resolution and blob storage
    /// all happen before the tree changes, so a failed event leaves it as is.
    pub fn apply(
        &mut self,
        event: &ReportEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        let outcome = match event {
            ReportEvent::Start(e) => self.start(e, false, ctx),
            ReportEvent::VerificationStart(e) => self.start(e, true, ctx),
            ReportEvent::Finish(e) => self.finish(e, false, ctx),
            ReportEvent::VerificationFinish(e) => self.finish(e, true, ctx),
            ReportEvent::Attrs(e) => self.add_attrs(e, ctx),
            ReportEvent::Data(e) => self.merge_data(e),
            ReportEvent::Safe(e) => self.add_safe(e, ctx),
            ReportEvent::Unsafe(e) => self.add_unsafe(e, ctx),
            ReportEvent::Unknown(e) => self.add_unknown(e, ctx),
            ReportEvent::JobCoverage(e) => self.add_coverage(e, ctx),
            ReportEvent::Progress(_) => Ok(ApplyOutcome::default()),
        }?;
        debug!(
            job = %self.job,
            kind = event.kind(),
            report = event.report_id().unwrap_or(""),
            "report event applied"
        );
        Ok(outcome)
    }

    /// Records a component failure: an unknown leaf under `path`, then the
    /// whole open stack is drained innermost first. `path` and its ancestors
    /// are flagged failed; any other open report is only force-finished.
    pub fn fail(
        &mut self,
        path: &str,
        problem: &str,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        let id = self.open_report(path)?;
        let leaf_path = self.free_child_path(path, "failure");
        let blob = ctx.blobs.store(problem.as_bytes())?;
        let leaf = self.insert(
            leaf_path,
            Some(id),
            Vec::new(),
            ReportKind::Unknown {
                problem: blob,
                problem_text: problem.trim().to_string(),
            },
        );
        let mut failed_chain = self.ancestors(id);
        failed_chain.push(id);
        let drained: Vec<ReportId> = self.open.drain(..).rev().collect();
        for rid in &drained {
            let failed = failed_chain.contains(rid);
            self.close(*rid, ctx.now, failed);
        }
        warn!(
            job = %self.job,
            report = path,
            closed = drained.len(),
            "component failed, open reports drained"
        );
        let forced = drained.into_iter().filter(|r| *r != id).collect();
        Ok(ApplyOutcome {
            report: Some(id),
            new_leaves: vec![leaf],
            touched_leaves: Vec::new(),
            forced,
            status_change: Some(JobStatus::Failed),
        })
    }

    fn start(
        &mut self,
        e: &StartEvent,
        verification: bool,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        validate_path(&e.id)?;
        if self.by_path.contains_key(&e.id) {
            return Err(IngestionError::DuplicateId(e.id.clone()).into());
        }
        let parent = if e.id == ROOT_PATH {
            if verification {
                return Err(BridgeError::malformed("root report can not be a verification report"));
            }
            if e.parent.is_some() {
                return Err(BridgeError::malformed("root report can not have a parent"));
            }
            None
        } else {
            let parent = e.parent.as_deref().ok_or_else(|| {
                BridgeError::malformed(format!("report '{}' has no parent id", e.id))
            })?;
            Some(self.open_parent(parent)?)
        };
        let data = object_or_empty(e.data.as_ref())?;
        let attrs = normalize_attrs(&e.attrs)?;

        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let log = store_entry(e.log.as_deref(), LOG_FILE, ctx)?;
        let verifier_input = store_raw(e.verifier_input.as_deref(), ctx)?;
        let coverage = store_coverage(e.coverage.as_ref(), ctx)?;
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);

        let component = ComponentData {
            component: e.name.clone().unwrap_or_else(|| last_segment(&e.id)),
            resources: e.resources,
            log,
            verifier_input,
            coverage,
            computer: e.comp.clone(),
            description: None,
            data,
            started_at: ctx.now,
            finished_at: None,
            failed: false,
        };
        let kind = if verification {
            ReportKind::Verification(component)
        } else {
            ReportKind::Component(component)
        };
        let id = self.insert(e.id.clone(), parent, attr_refs, kind);
        self.open.push(id);
        let mut outcome = ApplyOutcome::for_report(id);
        if parent.is_none() {
            info!(job = %self.job, "decision started");
            outcome.status_change = Some(JobStatus::Processing);
        }
        Ok(outcome)
    }

    fn finish(
        &mut self,
        e: &FinishEvent,
        verification: bool,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        let id = self.open_report(&e.id)?;
        if verification && !matches!(self.reports[id.0].kind, ReportKind::Verification(_)) {
            return Err(IngestionError::NotVerification(e.id.clone()).into());
        }
        let data = object_or_empty(e.data.as_ref())?;
        let attrs = normalize_attrs(&e.attrs)?;
        self.check_attr_conflicts(id, &attrs, &ctx.attrs.read())?;

        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let log = store_entry(e.log.as_deref(), LOG_FILE, ctx)?;
        let coverage = store_coverage(e.coverage.as_ref(), ctx)?;
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);

        let forced = self.force_finish_descendants(id, ctx.now);
        let report = &mut self.reports[id.0];
        report.attrs.extend(attr_refs);
        if let Some(c) = report.kind.component_mut() {
            if e.resources.is_some() {
                c.resources = e.resources;
            }
            if log.is_some() {
                c.log = log;
            }
            if e.desc.is_some() {
                c.description = e.desc.clone();
            }
            c.coverage.extend(coverage);
            c.data.extend(data);
            c.finished_at = Some(ctx.now);
        }
        self.open.retain(|o| *o != id);

        let mut outcome = ApplyOutcome::for_report(id);
        outcome.forced = forced;
        if !attrs.is_empty() {
            outcome.touched_leaves = self.leaves_under(id);
        }
        if self.reports[id.0].parent.is_none() {
            let status = if self.root_failed() {
                JobStatus::Failed
            } else {
                JobStatus::Solved
            };
            info!(job = %self.job, status = %status, "root report finished");
            outcome.status_change = Some(status);
        }
        Ok(outcome)
    }

    fn add_attrs(
        &mut self,
        e: &AttrsEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        let id = self.open_report(&e.id)?;
        let attrs = normalize_attrs(&e.attrs)?;
        self.check_attr_conflicts(id, &attrs, &ctx.attrs.read())?;
        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);
        self.reports[id.0].attrs.extend(attr_refs);
        let mut outcome = ApplyOutcome::for_report(id);
        outcome.touched_leaves = self.leaves_under(id);
        Ok(outcome)
    }

    fn merge_data(&mut self, e: &DataEvent) -> Result<ApplyOutcome, BridgeError> {
        let id = self.open_report(&e.id)?;
        let Value::Object(data) = &e.data else {
            return Err(BridgeError::malformed("data must be a JSON object"));
        };
        if let Some(c) = self.reports[id.0].kind.component_mut() {
            for (k, v) in data {
                c.data.insert(k.clone(), v.clone());
            }
        }
        Ok(ApplyOutcome::for_report(id))
    }

    fn add_safe(
        &mut self,
        e: &SafeEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        validate_path(&e.id)?;
        if self.by_path.contains_key(&e.id) {
            return Err(IngestionError::DuplicateId(e.id.clone()).into());
        }
        let parent = self.verification_parent(&e.parent)?;
        let attrs = normalize_attrs(&e.attrs)?;
        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let proof = store_entry(e.proof.as_deref(), PROOF_FILE, ctx)?;
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);
        let id = self.insert(e.id.clone(), Some(parent), attr_refs, ReportKind::Safe { proof });
        let mut outcome = ApplyOutcome::for_report(id);
        outcome.new_leaves.push(id);
        Ok(outcome)
    }

    fn add_unsafe(
        &mut self,
        e: &UnsafeEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        validate_path(&e.id)?;
        if e.error_traces.is_empty() {
            return Err(BridgeError::malformed(format!(
                "unsafe report '{}' has no error traces",
                e.id
            )));
        }
        let paths: Vec<String> = if e.error_traces.len() == 1 {
            vec![e.id.clone()]
        } else {
            (1..=e.error_traces.len())
                .map(|i| format!("{}/{}", e.id, i))
                .collect()
        };
        for path in &paths {
            if self.by_path.contains_key(path) {
                return Err(IngestionError::DuplicateId(path.clone()).into());
            }
        }
        let parent = self.verification_parent(&e.parent)?;
        let attrs = normalize_attrs(&e.attrs)?;

        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let mut traces = Vec::with_capacity(paths.len());
        for (path, archive) in paths.iter().zip(&e.error_traces) {
            let bytes = ctx.resolver.resolve(archive)?;
            let trace = read_archive_entry(&bytes, ERROR_TRACE_FILE)?;
            let trace_id = derive_trace_id(&self.job, path, &trace);
            let blob = ctx.blobs.store(&trace)?;
            traces.push((path.clone(), trace_id, blob));
        }
        let sources = store_raw(e.sources.as_deref(), ctx)?;
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);

        let mut outcome = ApplyOutcome::default();
        for (path, trace_id, error_trace) in traces {
            let id = self.insert(
                path,
                Some(parent),
                attr_refs.clone(),
                ReportKind::Unsafe {
                    trace_id,
                    error_trace,
                    sources: sources.clone(),
                },
            );
            outcome.report.get_or_insert(id);
            outcome.new_leaves.push(id);
        }
        Ok(outcome)
    }

    fn add_unknown(
        &mut self,
        e: &UnknownEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        validate_path(&e.id)?;
        if self.by_path.contains_key(&e.id) {
            return Err(IngestionError::DuplicateId(e.id.clone()).into());
        }
        let parent = self.open_parent(&e.parent)?;
        let attrs = normalize_attrs(&e.attrs)?;
        let attr_blobs = store_attr_data(&attrs, ctx)?;
        let bytes = ctx.resolver.resolve(&e.problem_desc)?;
        let desc = read_archive_entry(&bytes, PROBLEM_DESC_FILE)?;
        let problem = ctx.blobs.store(&desc)?;
        let problem_text = String::from_utf8_lossy(&desc).trim().to_string();
        let attr_refs = intern_attrs(&attrs, attr_blobs, ctx.attrs);
        let id = self.insert(
            e.id.clone(),
            Some(parent),
            attr_refs,
            ReportKind::Unknown {
                problem,
                problem_text,
            },
        );
        let mut outcome = ApplyOutcome::for_report(id);
        outcome.new_leaves.push(id);
        Ok(outcome)
    }

    fn add_coverage(
        &mut self,
        e: &CoverageEvent,
        ctx: &ApplyContext<'_>,
    ) -> Result<ApplyOutcome, BridgeError> {
        let id = *self
            .by_path
            .get(&e.id)
            .ok_or_else(|| IngestionError::UnknownReport(e.id.clone()))?;
        if self.reports[id.0].kind.is_leaf() {
            return Err(IngestionError::LeafParent(e.id.clone()).into());
        }
        let coverage = store_coverage(Some(&e.coverage), ctx)?;
        if let Some(c) = self.reports[id.0].kind.component_mut() {
            c.coverage.extend(coverage);
        }
        Ok(ApplyOutcome::for_report(id))
    }

    fn insert(
        &mut self,
        path: String,
        parent: Option<ReportId>,
        attrs: Vec<ReportAttr>,
        kind: ReportKind,
    ) -> ReportId {
        let id = ReportId(self.reports.len());
        self.by_path.insert(path.clone(), id);
        if let Some(p) = parent {
            self.reports[p.0].children.push(id);
        }
        self.reports.push(Report {
            id,
            path,
            parent,
            children: Vec::new(),
            attrs,
            kind,
        });
        id
    }

    fn open_parent(&self, path: &str) -> Result<ReportId, IngestionError> {
        let id = *self
            .by_path
            .get(path)
            .ok_or_else(|| IngestionError::UnknownParent(path.to_string()))?;
        let report = &self.reports[id.0];
        if report.kind.is_leaf() {
            return Err(IngestionError::LeafParent(path.to_string()));
        }
        if !report.is_open() {
            return Err(IngestionError::UnknownParent(path.to_string()));
        }
        Ok(id)
    }

    fn verification_parent(&self, path: &str) -> Result<ReportId, IngestionError> {
        let id = self.open_parent(path)?;
        match self.reports[id.0].kind {
            ReportKind::Verification(_) => Ok(id),
            _ => Err(IngestionError::NotVerification(path.to_string())),
        }
    }

    fn open_report(&self, path: &str) -> Result<ReportId, IngestionError> {
        let id = *self
            .by_path
            .get(path)
            .ok_or_else(|| IngestionError::UnknownReport(path.to_string()))?;
        if !self.reports[id.0].is_open() {
            return Err(IngestionError::AlreadyFinished(path.to_string()));
        }
        Ok(id)
    }

    fn check_attr_conflicts(
        &self,
        id: ReportId,
        attrs: &[NormalizedAttr],
        store: &AttrStore,
    ) -> Result<(), IngestionError> {
        let report = &self.reports[id.0];
        for existing in &report.attrs {
            let Some(name) = store.name(existing.attr) else { continue };
            if attrs.iter().any(|a| a.name == name) {
                return Err(IngestionError::AttrConflict {
                    report: report.path.clone(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Closes the open descendants of `id`, innermost first.
    fn force_finish_descendants(&mut self, id: ReportId, now: DateTime<Utc>) -> Vec<ReportId> {
        let descendants: Vec<ReportId> = self
            .open
            .iter()
            .rev()
            .copied()
            .filter(|o| *o != id && self.is_ancestor(id, *o))
            .collect();
        for d in &descendants {
            warn!(
                job = %self.job,
                report = %self.reports[d.0].path,
                "report force-finished by its ancestor"
            );
            self.close(*d, now, false);
        }
        self.open.retain(|o| !descendants.contains(o));
        descendants
    }

    fn close(&mut self, id: ReportId, now: DateTime<Utc>, failed: bool) {
        if let Some(c) = self.reports[id.0].kind.component_mut() {
            if c.finished_at.is_none() {
                c.finished_at = Some(now);
            }
            c.failed |= failed;
        }
    }

    fn free_child_path(&self, parent: &str, stem: &str) -> String {
        let base = if parent == ROOT_PATH {
            format!("/{}", stem)
        } else {
            format!("{}/{}", parent, stem)
        };
        if !self.by_path.contains_key(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !self.by_path.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Content-derived identity of an error trace within a job.
pub fn derive_trace_id(job: &str, path: &str, trace: &[u8]) -> String {
    let mut buf = Vec::with_capacity(job.len() + path.len() + trace.len() + 2);
    buf.extend_from_slice(job.as_bytes());
    buf.push(0);
    buf.extend_from_slice(path.as_bytes());
    buf.push(0);
    buf.extend_from_slice(trace);
    sha256_bytes(&buf)
}

fn validate_path(path: &str) -> Result<(), IngestionError> {
    if path == ROOT_PATH {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(IngestionError::Malformed(format!(
            "report id '{}' is not an absolute path",
            path
        )));
    }
    Ok(())
}

fn last_segment(path: &str) -> String {
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(ROOT_PATH)
        .to_string()
}

fn object_or_empty(data: Option<&Value>) -> Result<Map<String, Value>, IngestionError> {
    match data {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(IngestionError::Malformed("data must be a JSON object".to_string())),
    }
}

fn store_entry(
    archive: Option<&str>,
    entry: &str,
    ctx: &ApplyContext<'_>,
) -> Result<Option<BlobHandle>, BridgeError> {
    let Some(archive) = archive else { return Ok(None) };
    let bytes = ctx.resolver.resolve(archive)?;
    let content = read_archive_entry(&bytes, entry)?;
    Ok(Some(ctx.blobs.store(&content)?))
}

fn store_raw(archive: Option<&str>, ctx: &ApplyContext<'_>) -> Result<Option<BlobHandle>, BridgeError> {
    let Some(archive) = archive else { return Ok(None) };
    let bytes = ctx.resolver.resolve(archive)?;
    Ok(Some(ctx.blobs.store(&bytes)?))
}

fn store_coverage(
    coverage: Option<&CoverageSpec>,
    ctx: &ApplyContext<'_>,
) -> Result<BTreeMap<String, BlobHandle>, BridgeError> {
    let mut out = BTreeMap::new();
    let Some(coverage) = coverage else { return Ok(out) };
    for (name, archive) in coverage.entries() {
        let bytes = ctx.resolver.resolve(&archive)?;
        out.insert(name, ctx.blobs.store(&bytes)?);
    }
    Ok(out)
}

fn store_attr_data(
    attrs: &[NormalizedAttr],
    ctx: &ApplyContext<'_>,
) -> Result<Vec<Option<BlobHandle>>, BridgeError> {
    attrs
        .iter()
        .map(|a| store_raw(a.data.as_deref(), ctx))
        .collect()
}

fn intern_attrs(
    attrs: &[NormalizedAttr],
    blobs: Vec<Option<BlobHandle>>,
    store: &RwLock<AttrStore>,
) -> Vec<ReportAttr> {
    let mut store = store.write();
    attrs
        .iter()
        .zip(blobs)
        .map(|(a, data)| ReportAttr {
            attr: store.intern(&a.name, &a.value),
            compare: a.compare,
            associate: a.associate,
            data,
        })
        .collect()
}
