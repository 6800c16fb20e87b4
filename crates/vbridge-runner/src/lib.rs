//! The bridge service: per-job locking, authorization, batch application,
//! mark recomputation and persistence of the whole state.

mod config;
mod store;

pub use config::{
    config_path, config_template, find_project_root, load_config, parse_config, BridgeConfig,
    IngestConfig, LogConfig, MarksConfig, StorageConfig, CONFIG_DIR, CONFIG_FILE,
};
pub use store::{check_job_id, JobSnapshot, StateDir, StateLock};

use anyhow::{anyhow, Result};
use chrono::Utc;
use jsonschema::JSONSchema;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use vbridge_core::{Attachments, BlobStore, BridgeError, DirBlobStore, IngestionError};
use vbridge_marks::{
    leaf_verdict, read_mark_bytes, Association, AssociationEngine, AssociationKind,
    AssociationSet, ConnectScope, ConnectStats, JobSummary, LeafVerdict, MarkDocument, MarkError,
    MarkStore, MarkType,
};
use vbridge_reports::{
    ApplyContext, ApplyOutcome, AttrStore, JobProgress, JobStatus, ProgressTracker, ReportEvent,
    ReportId, ReportTree, ROOT_PATH,
};
use vbridge_schemas::{compile_schema, validate_value};

/// Source of truth for job states, owned by the job management side.
pub trait JobLifecycle: Send + Sync {
    fn get_status(&self, job: &str) -> JobStatus;
    fn set_status(&self, job: &str, status: JobStatus) -> Result<(), BridgeError>;
}

#[derive(Debug, Default)]
pub struct MemoryLifecycle {
    statuses: RwLock<HashMap<String, JobStatus>>,
}

impl MemoryLifecycle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLifecycle for MemoryLifecycle {
    fn get_status(&self, job: &str) -> JobStatus {
        self.statuses.read().get(job).copied().unwrap_or_default()
    }

    fn set_status(&self, job: &str, status: JobStatus) -> Result<(), BridgeError> {
        self.statuses.write().insert(job.to_string(), status);
        Ok(())
    }
}

/// Yes/no check run before anything mutates a job.
pub trait Authorizer: Send + Sync {
    fn can_modify(&self, user: &str, job: &str) -> bool;
}

/// Allows the listed service users. An empty list allows everyone.
#[derive(Debug, Clone, Default)]
pub struct ServiceUsers {
    users: BTreeSet<String>,
}

impl ServiceUsers {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for ServiceUsers {
    fn can_modify(&self, user: &str, _job: &str) -> bool {
        self.users.is_empty() || self.users.contains(user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventFailure {
    pub index: usize,
    pub code: String,
    pub message: String,
}

impl EventFailure {
    fn new(index: usize, err: &BridgeError) -> Self {
        Self {
            index,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result of one uploaded batch. Events before a failure stay committed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job: String,
    pub applied: usize,
    pub failures: Vec<EventFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<EventFailure>,
    pub new_leaves: usize,
    pub associations: ConnectStats,
    pub status: JobStatus,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

/// Outcome of a mark change after every job was reconnected.
#[derive(Debug, Clone, Serialize)]
pub struct MarkChange {
    pub mark: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub jobs: usize,
    pub associations: ConnectStats,
}

struct JobState {
    tree: ReportTree,
    associations: AssociationSet,
}

impl JobState {
    fn new(job: &str) -> Self {
        Self {
            tree: ReportTree::new(job),
            associations: AssociationSet::new(),
        }
    }
}

/// Lock order: a job slot, then `marks`, then `attrs_save`, then `attrs`,
/// then `progress`. Mark changes walk the jobs holding one slot at a time.
/// `attrs` is never held across archive reads or blob writes.
pub struct Bridge {
    jobs: RwLock<HashMap<String, Arc<Mutex<JobState>>>>,
    marks: RwLock<MarkStore>,
    attrs: RwLock<AttrStore>,
    attrs_save: Mutex<()>,
    progress: Mutex<ProgressTracker>,
    engine: AssociationEngine,
    blobs: Arc<dyn BlobStore>,
    lifecycle: Arc<dyn JobLifecycle>,
    authorizer: Arc<dyn Authorizer>,
    state: Option<StateDir>,
    event_schema: Option<JSONSchema>,
}

impl Bridge {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            marks: RwLock::new(MarkStore::new()),
            attrs: RwLock::new(AttrStore::new()),
            attrs_save: Mutex::new(()),
            progress: Mutex::new(ProgressTracker::new()),
            engine: AssociationEngine::new(),
            blobs,
            lifecycle: Arc::new(MemoryLifecycle::new()),
            authorizer: Arc::new(ServiceUsers::default()),
            state: None,
            event_schema: None,
        }
    }

    /// Bridge over the directories of `config`, with its saved state loaded.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        let blobs = Arc::new(DirBlobStore::new(config.storage.blob_dir.clone()));
        let mut bridge = Bridge::new(blobs)
            .with_authorizer(Arc::new(ServiceUsers::new(
                config.ingest.service_users.iter().cloned(),
            )))
            .with_state_dir(StateDir::new(config.storage.state_dir.clone()));
        if config.ingest.validate_events {
            bridge = bridge.with_event_validation()?;
        }
        bridge.restore()?;
        Ok(bridge)
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn JobLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_state_dir(mut self, state: StateDir) -> Self {
        self.state = Some(state);
        self
    }

    /// Checks every incoming event against `report_event_v1` before parsing.
    pub fn with_event_validation(mut self) -> Result<Self> {
        self.event_schema = Some(compile_schema("report_event_v1.jsonschema")?);
        Ok(self)
    }

    pub fn state_dir(&self) -> Option<&StateDir> {
        self.state.as_ref()
    }

    /// Loads snapshots written by an earlier process. Returns the number of
    /// jobs restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(state) = &self.state else { return Ok(0) };
        if let Some(attrs) = state.load_attrs()? {
            *self.attrs.write() = attrs;
        }
        if let Some(marks) = state.load_marks()? {
            *self.marks.write() = marks;
        }
        let snapshots = state.load_jobs()?;
        let count = snapshots.len();
        let mut jobs = self.jobs.write();
        for snapshot in snapshots {
            self.lifecycle.set_status(&snapshot.job, snapshot.status)?;
            if let Some(progress) = snapshot.progress {
                self.progress.lock().insert(&snapshot.job, progress);
            }
            jobs.insert(
                snapshot.job.clone(),
                Arc::new(Mutex::new(JobState {
                    tree: snapshot.tree,
                    associations: snapshot.associations,
                })),
            );
        }
        info!(jobs = count, marks = self.marks.read().len(), "bridge state restored");
        Ok(count)
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status(&self, job: &str) -> JobStatus {
        self.lifecycle.get_status(job)
    }

    pub fn progress(&self, job: &str) -> Option<JobProgress> {
        self.progress.lock().get(job).cloned()
    }

    pub fn mark_count(&self) -> usize {
        self.marks.read().len()
    }

    /// Full copy of one job as it would be saved.
    pub fn snapshot(&self, job: &str) -> Option<JobSnapshot> {
        let slot = self.jobs.read().get(job).cloned()?;
        let state = slot.lock();
        Some(self.snapshot_of(job, &state))
    }

    fn snapshot_of(&self, job: &str, state: &JobState) -> JobSnapshot {
        JobSnapshot {
            job: job.to_string(),
            status: self.lifecycle.get_status(job),
            tree: state.tree.clone(),
            associations: state.associations.clone(),
            progress: self.progress.lock().get(job).cloned(),
            saved_at: Utc::now(),
        }
    }

    fn job_slot(&self, job: &str) -> Arc<Mutex<JobState>> {
        if let Some(slot) = self.jobs.read().get(job) {
            return slot.clone();
        }
        self.jobs
            .write()
            .entry(job.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(JobState::new(job))))
            .clone()
    }

    fn existing_slot(&self, job: &str) -> Result<Arc<Mutex<JobState>>> {
        self.jobs
            .read()
            .get(job)
            .cloned()
            .ok_or_else(|| anyhow!("unknown_job: job '{}' has no reports", job))
    }

    fn authorize(&self, user: &str, job: &str) -> Result<(), BridgeError> {
        check_job_id(job)?;
        if self.authorizer.can_modify(user, job) {
            Ok(())
        } else {
            Err(BridgeError::Authorization(format!(
                "user '{}' may not modify job '{}'",
                user, job
            )))
        }
    }

    fn move_status(&self, job: &str, to: JobStatus) -> Result<JobStatus, BridgeError> {
        let from = self.lifecycle.get_status(job);
        let to = from.transition(to)?;
        self.lifecycle.set_status(job, to)?;
        info!(job, from = %from, to = %to, "job status changed");
        Ok(to)
    }

    /// The attribute table is shared by all jobs; its saves are serialized
    /// so the file on disk is never older than a table already written.
    fn persist_job(&self, job: &str, state: &JobState) -> Result<(), BridgeError> {
        let Some(dir) = &self.state else { return Ok(()) };
        dir.save_job(&self.snapshot_of(job, state))?;
        let _saving = self.attrs_save.lock();
        dir.save_attrs(&self.attrs.read())
    }

    /// Starts a new decision attempt: the job goes to PENDING and its
    /// previous tree, associations and progress are dropped.
    pub fn start_decision(&self, user: &str, job: &str) -> Result<JobStatus> {
        self.authorize(user, job)?;
        let slot = self.job_slot(job);
        let mut state = slot.lock();
        let status = self.move_status(job, JobStatus::Pending)?;
        *state = JobState::new(job);
        self.engine.forget_job(job);
        self.progress.lock().reset(job);
        self.persist_job(job, &state)?;
        Ok(status)
    }

    /// Applies `events` in order. Per-event errors are collected; a state or
    /// authorization error stops the batch at that event.
    pub fn apply_batch(
        &self,
        user: &str,
        job: &str,
        events: Vec<Value>,
        attachments: &Attachments,
    ) -> Result<BatchReport> {
        let mut report = BatchReport {
            job: job.to_string(),
            applied: 0,
            failures: Vec::new(),
            aborted: None,
            new_leaves: 0,
            associations: ConnectStats::default(),
            status: self.lifecycle.get_status(job),
        };
        if let Err(e) = self.authorize(user, job) {
            warn!(job, user, error = %e, "batch rejected");
            report.aborted = Some(EventFailure::new(0, &e));
            return Ok(report);
        }
        let slot = self.job_slot(job);
        let mut state = slot.lock();
        let total = events.len();
        for (index, raw) in events.into_iter().enumerate() {
            match self.apply_event(job, &mut state, raw, attachments) {
                Ok((outcome, stats)) => {
                    report.applied += 1;
                    report.new_leaves += outcome.new_leaves.len();
                    add_stats(&mut report.associations, stats);
                }
                Err(e) if e.aborts_batch() => {
                    warn!(job, index, error = %e, "batch aborted");
                    report.aborted = Some(EventFailure::new(index, &e));
                    break;
                }
                Err(e) => {
                    warn!(job, index, error = %e, "event rejected");
                    report.failures.push(EventFailure::new(index, &e));
                }
            }
        }
        if report.applied > 0 {
            self.persist_job(job, &state)?;
        }
        report.status = self.lifecycle.get_status(job);
        info!(
            job,
            events = total,
            applied = report.applied,
            failed = report.failures.len(),
            aborted = report.aborted.is_some(),
            status = %report.status,
            "batch applied"
        );
        Ok(report)
    }

    fn apply_event(
        &self,
        job: &str,
        state: &mut JobState,
        raw: Value,
        attachments: &Attachments,
    ) -> Result<(ApplyOutcome, ConnectStats), BridgeError> {
        if let Some(schema) = &self.event_schema {
            validate_value(schema, &raw).map_err(|e| BridgeError::malformed(e.to_string()))?;
        }
        let event =
            ReportEvent::from_value(raw).map_err(|e| BridgeError::malformed(e.to_string()))?;
        let status = self.lifecycle.get_status(job);
        // A repeated root start of a running decision is a duplicate report,
        // left to the tree to reject.
        let repeated_root = event.is_decision_start()
            && status == JobStatus::Processing
            && state.tree.root().is_some();
        if !repeated_root {
            status.check_event(event.is_decision_start())?;
        }
        let now = Utc::now();
        if let ReportEvent::Progress(e) = &event {
            self.progress.lock().update(job, &e.progress, now)?;
            return Ok((ApplyOutcome::default(), ConnectStats::default()));
        }
        let ctx = ApplyContext {
            resolver: attachments,
            blobs: self.blobs.as_ref(),
            attrs: &self.attrs,
            now,
        };
        let outcome = state.tree.apply(&event, &ctx)?;
        if let Some(update) = event.progress() {
            if let Err(e) = self.progress.lock().update(job, update, now) {
                warn!(job, report = event.report_id().unwrap_or(""), error = %e, "progress ignored");
            }
        }
        if let Some(next) = outcome.status_change {
            self.move_status(job, next)?;
        }
        let stats = self.connect_reports(state, &outcome);
        Ok((outcome, stats))
    }

    fn connect_reports(&self, state: &mut JobState, outcome: &ApplyOutcome) -> ConnectStats {
        let ids: Vec<ReportId> = outcome
            .new_leaves
            .iter()
            .chain(outcome.touched_leaves.iter())
            .copied()
            .collect();
        if ids.is_empty() {
            return ConnectStats::default();
        }
        let marks = self.marks.read();
        let attrs = self.attrs.read();
        self.engine.connect(
            &state.tree,
            &attrs,
            &marks,
            self.blobs.as_ref(),
            &mut state.associations,
            ConnectScope::Reports(&ids),
        )
    }

    /// Records a component failure reported outside the event stream.
    pub fn fail_component(
        &self,
        user: &str,
        job: &str,
        path: &str,
        problem: &str,
    ) -> Result<JobStatus> {
        self.authorize(user, job)?;
        let slot = self.existing_slot(job)?;
        let mut state = slot.lock();
        self.lifecycle.get_status(job).check_event(false)?;
        self.fail_locked(job, &mut state, path, problem)
    }

    fn fail_locked(
        &self,
        job: &str,
        state: &mut JobState,
        path: &str,
        problem: &str,
    ) -> Result<JobStatus> {
        let no_files = Attachments::new();
        let ctx = ApplyContext {
            resolver: &no_files,
            blobs: self.blobs.as_ref(),
            attrs: &self.attrs,
            now: Utc::now(),
        };
        let outcome = state.tree.fail(path, problem, &ctx)?;
        if let Some(next) = outcome.status_change {
            self.move_status(job, next)?;
        }
        self.connect_reports(state, &outcome);
        self.persist_job(job, state)?;
        Ok(self.lifecycle.get_status(job))
    }

    /// Externally reported fatal failure of a processing job.
    pub fn fail_job(&self, user: &str, job: &str, problem: &str) -> Result<JobStatus> {
        self.authorize(user, job)?;
        let slot = self.existing_slot(job)?;
        let mut state = slot.lock();
        if self.lifecycle.get_status(job) != JobStatus::Processing {
            return Err(BridgeError::State(format!("job '{}' is not processing", job)).into());
        }
        if state.tree.is_root_open() {
            return self.fail_locked(job, &mut state, ROOT_PATH, problem);
        }
        let status = self.move_status(job, JobStatus::Failed)?;
        self.persist_job(job, &state)?;
        Ok(status)
    }

    /// The scheduler considers the job done. A root report that is still
    /// open means the stream was cut short.
    pub fn scheduler_finished(&self, user: &str, job: &str) -> Result<JobStatus> {
        self.authorize(user, job)?;
        let slot = self.existing_slot(job)?;
        let state = slot.lock();
        let status = self.lifecycle.get_status(job);
        match status {
            JobStatus::Solved | JobStatus::Failed => Ok(status),
            JobStatus::Processing => {
                warn!(job, root_open = state.tree.is_root_open(), "job finished by scheduler with open reports");
                let status = self.move_status(job, JobStatus::Corrupted)?;
                self.persist_job(job, &state)?;
                Ok(status)
            }
            other => Err(BridgeError::State(format!(
                "scheduler finished job '{}' while it is {}",
                job, other
            ))
            .into()),
        }
    }

    pub fn cancel(&self, job: &str) -> Result<JobStatus> {
        self.signal(job, JobStatus::Cancelling)
    }

    pub fn cancelled(&self, job: &str) -> Result<JobStatus> {
        self.signal(job, JobStatus::Cancelled)
    }

    pub fn terminate(&self, job: &str) -> Result<JobStatus> {
        self.signal(job, JobStatus::Terminated)
    }

    fn signal(&self, job: &str, to: JobStatus) -> Result<JobStatus> {
        check_job_id(job)?;
        let slot = self.job_slot(job);
        let state = slot.lock();
        let status = self.move_status(job, to)?;
        self.persist_job(job, &state)?;
        Ok(status)
    }

    /// Adds a version to mark `id` (creating it) and reconnects every job.
    pub fn upsert_mark(&self, id: &str, mark_type: MarkType, doc: &Value) -> Result<MarkChange> {
        let version = MarkDocument::from_value(doc)?.into_version(mark_type, Utc::now())?;
        let number = {
            let mut marks = self.marks.write();
            let number = marks.upsert(id, version)?.version_number();
            self.persist_marks(&marks)?;
            number
        };
        info!(mark = id, version = number, "mark saved");
        let mut change = self.reconnect_marks(&[id.to_string()])?;
        change.version = Some(number);
        Ok(change)
    }

    /// Imports a mark archive or preset, replacing a mark with the same id.
    pub fn import_mark(&self, bytes: &[u8]) -> Result<MarkChange> {
        let mark = read_mark_bytes(bytes, Utc::now())?;
        let id = mark.identifier.clone();
        let number = mark.version_number();
        {
            let mut marks = self.marks.write();
            marks.replace(mark)?;
            self.persist_marks(&marks)?;
        }
        let mut change = self.reconnect_marks(&[id])?;
        change.version = Some(number);
        Ok(change)
    }

    pub fn delete_mark(&self, id: &str) -> Result<MarkChange> {
        {
            let mut marks = self.marks.write();
            marks.remove(id)?;
            self.persist_marks(&marks)?;
        }
        info!(mark = id, "mark deleted");
        self.reconnect_marks(&[id.to_string()])
    }

    fn persist_marks(&self, marks: &MarkStore) -> Result<(), BridgeError> {
        match &self.state {
            Some(dir) => dir.save_marks(marks),
            None => Ok(()),
        }
    }

    fn reconnect_marks(&self, ids: &[String]) -> Result<MarkChange> {
        let slots: Vec<(String, Arc<Mutex<JobState>>)> = self
            .jobs
            .read()
            .iter()
            .map(|(job, slot)| (job.clone(), slot.clone()))
            .collect();
        let mut total = ConnectStats::default();
        for (job, slot) in &slots {
            let mut state = slot.lock();
            let stats = {
                let marks = self.marks.read();
                let attrs = self.attrs.read();
                let JobState { tree, associations } = &mut *state;
                self.engine.connect(
                    tree,
                    &attrs,
                    &marks,
                    self.blobs.as_ref(),
                    associations,
                    ConnectScope::Marks(ids),
                )
            };
            if stats.created + stats.refreshed + stats.removed > 0 {
                self.persist_job(job, &state)?;
            }
            add_stats(&mut total, stats);
        }
        Ok(MarkChange {
            mark: ids.join(","),
            version: None,
            jobs: slots.len(),
            associations: total,
        })
    }

    /// Operator confirmation of an existing association.
    pub fn confirm(&self, user: &str, job: &str, mark: &str, path: &str) -> Result<Association> {
        self.set_association_kind(user, job, mark, path, AssociationKind::Confirmed)
    }

    pub fn unconfirm(&self, user: &str, job: &str, mark: &str, path: &str) -> Result<Association> {
        self.set_association_kind(user, job, mark, path, AssociationKind::Unconfirmed)
    }

    fn set_association_kind(
        &self,
        user: &str,
        job: &str,
        mark: &str,
        path: &str,
        kind: AssociationKind,
    ) -> Result<Association> {
        self.authorize(user, job)?;
        let slot = self.existing_slot(job)?;
        let mut state = slot.lock();
        let report = find_report(&state.tree, path)?;
        let association = state.associations.set_kind(mark, report, kind)?.clone();
        self.persist_job(job, &state)?;
        info!(job, mark, report = path, kind = ?kind, "association changed");
        Ok(association)
    }

    /// Drops an association. A later recomputation may bring it back as
    /// automatic if the mark still matches.
    pub fn clear_association(
        &self,
        user: &str,
        job: &str,
        mark: &str,
        path: &str,
    ) -> Result<Association> {
        self.authorize(user, job)?;
        let slot = self.existing_slot(job)?;
        let mut state = slot.lock();
        let report = find_report(&state.tree, path)?;
        let removed = state.associations.clear(mark, report)?;
        self.persist_job(job, &state)?;
        Ok(removed)
    }

    /// Verdict counts under `path`, or under the root when `None`.
    pub fn summary(&self, job: &str, path: Option<&str>) -> Result<JobSummary> {
        let slot = self.existing_slot(job)?;
        let state = slot.lock();
        let root = path.map(|p| find_report(&state.tree, p)).transpose()?;
        let marks = self.marks.read();
        Ok(JobSummary::compute(&state.tree, root, &state.associations, &marks))
    }

    pub fn verdict(&self, job: &str, path: &str) -> Result<LeafVerdict> {
        let slot = self.existing_slot(job)?;
        let state = slot.lock();
        let report = find_report(&state.tree, path)?;
        let marks = self.marks.read();
        leaf_verdict(&state.tree, report, &state.associations, &marks)
            .ok_or_else(|| anyhow!("not_leaf: report '{}' has no verdict", path))
    }
}

fn find_report(tree: &ReportTree, path: &str) -> Result<ReportId, BridgeError> {
    tree.find(path)
        .map(|r| r.id)
        .ok_or_else(|| IngestionError::UnknownReport(path.to_string()).into())
}

fn add_stats(total: &mut ConnectStats, stats: ConnectStats) {
    total.pairs += stats.pairs;
    total.created += stats.created;
    total.refreshed += stats.refreshed;
    total.removed += stats.removed;
    total.errors += stats.errors;
}

/// Accepts a single event object or a list of them.
pub fn events_from_value(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Stable snake_case code of an error raised by a bridge operation.
pub fn error_code(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<BridgeError>() {
        return e.code().to_string();
    }
    if let Some(e) = err.downcast_ref::<IngestionError>() {
        return BridgeError::Ingestion(e.clone()).code().to_string();
    }
    if let Some(e) = err.downcast_ref::<MarkError>() {
        return e.code().to_string();
    }
    let msg = err.to_string();
    match msg.split_once(':') {
        Some((code, _))
            if !code.is_empty() && code.chars().all(|c| c.is_ascii_lowercase() || c == '_') =>
        {
            code.to_string()
        }
        _ => "command_failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use vbridge_core::MemoryBlobStore;

    fn bridge() -> Bridge {
        Bridge::new(Arc::new(MemoryBlobStore::new()))
    }

    fn open_job(bridge: &Bridge, job: &str) {
        bridge.start_decision("svc", job).expect("decision");
        let report = bridge
            .apply_batch(
                "svc",
                job,
                vec![
                    json!({"type": "start", "id": "/", "attrs": [{"name": "Module", "value": "net"}]}),
                    json!({"type": "verification", "id": "/v", "parent id": "/"}),
                ],
                &Attachments::new(),
            )
            .expect("batch");
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn denied_user_aborts_before_any_event() {
        let bridge = bridge().with_authorizer(Arc::new(ServiceUsers::new(["svc"])));
        bridge.start_decision("svc", "j").expect("decision");
        let report = bridge
            .apply_batch(
                "intruder",
                "j",
                vec![json!({"type": "start", "id": "/"})],
                &Attachments::new(),
            )
            .expect("batch");
        let aborted = report.aborted.expect("aborted");
        assert_eq!(aborted.index, 0);
        assert_eq!(aborted.code, "authorization_error");
        assert_eq!(report.applied, 0);
        assert_eq!(bridge.status("j"), JobStatus::Pending);
        let err = bridge.start_decision("intruder", "j").expect_err("denied");
        assert_eq!(error_code(&err), "authorization_error");
    }

    #[test]
    fn local_errors_are_collected_and_batch_continues() {
        let b = bridge();
        open_job(&b, "j");
        let report = b
            .apply_batch(
                "svc",
                "j",
                vec![
                    json!({"type": "start", "id": "/v", "parent id": "/"}),
                    json!({"type": "finish", "id": "/nope"}),
                    json!({"type": "bogus"}),
                    json!({"type": "unsafe", "id": "/v/u", "parent id": "/v", "error traces": ["missing.json"]}),
                    json!({"type": "safe", "id": "/v/s", "parent id": "/v"}),
                ],
                &Attachments::new(),
            )
            .expect("batch");
        let codes: Vec<(usize, &str)> = report
            .failures
            .iter()
            .map(|f| (f.index, f.code.as_str()))
            .collect();
        assert_eq!(
            codes,
            vec![
                (0, "duplicate_id"),
                (1, "unknown_report"),
                (2, "malformed_event"),
                (3, "missing_archive"),
            ]
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.new_leaves, 1);
        assert!(report.aborted.is_none());
    }

    #[test]
    fn cancellation_stops_the_rest_of_a_batch() {
        let b = bridge();
        open_job(&b, "j");
        b.cancel("j").expect("cancel");
        let report = b
            .apply_batch(
                "svc",
                "j",
                vec![json!({"type": "safe", "id": "/v/s", "parent id": "/v"})],
                &Attachments::new(),
            )
            .expect("batch");
        assert_eq!(report.aborted.expect("aborted").code, "state_error");
        assert_eq!(report.applied, 0);
        assert_eq!(b.cancelled("j").expect("cancelled"), JobStatus::Cancelled);
        assert_eq!(b.start_decision("svc", "j").expect("again"), JobStatus::Pending);
    }

    #[test]
    fn events_before_decision_start_are_rejected() {
        let b = bridge();
        let report = b
            .apply_batch(
                "svc",
                "j",
                vec![
                    json!({"type": "start", "id": "/"}),
                    json!({"type": "start", "id": "/c", "parent id": "/"}),
                ],
                &Attachments::new(),
            )
            .expect("batch");
        assert_eq!(report.applied, 2, "{:?}", report);
        assert_eq!(b.status("j"), JobStatus::Processing);

        let b = bridge();
        b.start_decision("svc", "k").expect("decision");
        let report = b
            .apply_batch(
                "svc",
                "k",
                vec![json!({"type": "start", "id": "/c", "parent id": "/"})],
                &Attachments::new(),
            )
            .expect("batch");
        assert_eq!(report.aborted.expect("aborted").code, "state_error");
    }

    #[test]
    fn scheduler_finish_with_open_root_corrupts_job() {
        let b = bridge();
        open_job(&b, "j");
        assert_eq!(b.scheduler_finished("svc", "j").expect("finish"), JobStatus::Corrupted);

        open_job(&b, "k");
        b.apply_batch(
            "svc",
            "k",
            vec![
                json!({"type": "verification finish", "id": "/v"}),
                json!({"type": "finish", "id": "/"}),
            ],
            &Attachments::new(),
        )
        .expect("batch");
        assert_eq!(b.status("k"), JobStatus::Solved);
        assert_eq!(b.scheduler_finished("svc", "k").expect("finish"), JobStatus::Solved);
    }

    #[test]
    fn fail_job_drains_open_reports() {
        let b = bridge();
        open_job(&b, "j");
        assert_eq!(b.fail_job("svc", "j", "scheduler lost the node").expect("fail"), JobStatus::Failed);
        let snapshot = b.snapshot("j").expect("snapshot");
        assert!(!snapshot.tree.is_root_open());
        assert!(snapshot.tree.find("/failure").is_some());
        let err = b.fail_job("svc", "j", "again").expect_err("not processing");
        assert_eq!(error_code(&err), "state_error");
    }

    #[test]
    fn scheduler_signals_need_a_permitted_user() {
        let b = bridge().with_authorizer(Arc::new(ServiceUsers::new(["svc"])));
        open_job(&b, "j");
        let err = b.fail_job("intruder", "j", "node lost").expect_err("denied");
        assert_eq!(error_code(&err), "authorization_error");
        let err = b.scheduler_finished("intruder", "j").expect_err("denied");
        assert_eq!(error_code(&err), "authorization_error");
        let snapshot = b.snapshot("j").expect("snapshot");
        assert!(snapshot.tree.is_root_open());
        assert!(snapshot.tree.find("/failure").is_none());
        assert_eq!(b.status("j"), JobStatus::Processing);
    }

    #[test]
    fn signals_for_unknown_jobs_leave_no_trace() {
        let b = bridge();
        let err = b.scheduler_finished("svc", "ghost").expect_err("no such job");
        assert_eq!(error_code(&err), "unknown_job");
        let err = b.fail_job("svc", "ghost", "lost").expect_err("no such job");
        assert_eq!(error_code(&err), "unknown_job");
        let err = b.cancel("../ghost").expect_err("bad id");
        assert_eq!(error_code(&err), "malformed_event");
        assert!(b.job_ids().is_empty());
    }

    #[test]
    fn repeated_root_start_is_a_local_duplicate() {
        let b = bridge();
        b.start_decision("svc", "j").expect("decision");
        let report = b
            .apply_batch(
                "svc",
                "j",
                vec![
                    json!({"type": "start", "id": "/"}),
                    json!({"type": "start", "id": "/"}),
                    json!({"type": "start", "id": "/c", "parent id": "/"}),
                ],
                &Attachments::new(),
            )
            .expect("batch");
        assert!(report.aborted.is_none(), "{:?}", report);
        assert_eq!(report.applied, 2);
        let codes: Vec<(usize, &str)> = report
            .failures
            .iter()
            .map(|f| (f.index, f.code.as_str()))
            .collect();
        assert_eq!(codes, vec![(1, "duplicate_id")]);
        assert_eq!(b.status("j"), JobStatus::Processing);
        assert!(b.snapshot("j").expect("snapshot").tree.find("/c").is_some());
    }

    fn unsafe_batch(b: &Bridge, job: &str, callee: &str) {
        let trace = json!({
            "format": 1,
            "funcs": ["main", callee],
            "trace": {"type": "thread", "thread": 1, "children": [
                {"type": "function call", "func": 0, "children": [
                    {"type": "function call", "func": 1, "children": []}
                ]}
            ]}
        });
        let mut files = Attachments::new();
        files.insert("trace.json", serde_json::to_vec(&trace).expect("trace"));
        b.start_decision("svc", job).expect("decision");
        let report = b
            .apply_batch(
                "svc",
                job,
                vec![
                    json!({"type": "start", "id": "/"}),
                    json!({"type": "verification", "id": "/v", "parent id": "/"}),
                    json!({"type": "unsafe", "id": "/v/u", "parent id": "/v", "error traces": ["trace.json"]}),
                ],
                &files,
            )
            .expect("batch");
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn new_decision_drops_cached_traces_of_the_old_tree() {
        let b = bridge();
        b.upsert_mark(
            "lock",
            MarkType::Unsafe,
            &json!({"attrs": [], "verdict": "bug", "conversion_function": 1,
                    "comparison_function": 0, "similarity": 1.0,
                    "error_trace": ["call main", "call lock", "return lock", "return main"]}),
        )
        .expect("mark");
        for callee in ["lock", "unlock", "relock"] {
            unsafe_batch(&b, "j", callee);
        }
        assert_eq!(b.engine.cached_traces(), 1);
        unsafe_batch(&b, "k", "lock");
        assert_eq!(b.engine.cached_traces(), 2);
    }

    struct GatedBlobs {
        inner: MemoryBlobStore,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl BlobStore for GatedBlobs {
        fn store(&self, bytes: &[u8]) -> Result<vbridge_core::BlobHandle, BridgeError> {
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
                let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
            }
            self.inner.store(bytes)
        }

        fn read(&self, handle: &vbridge_core::BlobHandle) -> Result<Vec<u8>, BridgeError> {
            self.inner.read(handle)
        }
    }

    #[test]
    fn slow_blob_write_does_not_block_other_jobs() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let b = Arc::new(Bridge::new(Arc::new(GatedBlobs {
            inner: MemoryBlobStore::new(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        })));
        b.start_decision("svc", "a").expect("decision a");
        b.start_decision("svc", "b").expect("decision b");

        let slow = {
            let b = b.clone();
            thread::spawn(move || {
                let mut files = Attachments::new();
                files.insert("log.txt", b"verifier log".to_vec());
                b.apply_batch(
                    "svc",
                    "a",
                    vec![json!({"type": "start", "id": "/", "log": "log.txt",
                                "attrs": [{"name": "Module", "value": "net"}]})],
                    &files,
                )
            })
        };
        entered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("job a is writing its log");

        let (done_tx, done_rx) = mpsc::channel();
        let fast = {
            let b = b.clone();
            thread::spawn(move || {
                let applied = b
                    .apply_batch(
                        "svc",
                        "b",
                        vec![json!({"type": "start", "id": "/",
                                    "attrs": [{"name": "Module", "value": "usb"}]})],
                        &Attachments::new(),
                    )
                    .map(|r| r.applied)
                    .unwrap_or(0);
                let _ = done_tx.send(applied);
            })
        };
        let applied = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("job b finished while job a was still writing");
        assert_eq!(applied, 1);

        release_tx.send(()).expect("release");
        let report = slow.join().expect("join a").expect("batch a");
        assert!(report.is_clean(), "{:?}", report);
        fast.join().expect("join b");
        assert_eq!(b.status("a"), JobStatus::Processing);
        assert_eq!(b.status("b"), JobStatus::Processing);
    }

    #[test]
    fn progress_errors_are_local_to_standalone_events() {
        let b = bridge();
        open_job(&b, "j");
        let report = b
            .apply_batch(
                "svc",
                "j",
                vec![
                    json!({"type": "progress", "progress": {"total tasks to be generated": 4, "solved tasks": 1}}),
                    json!({"type": "progress", "progress": {"total tasks to be generated": 4, "solved tasks": 9}}),
                ],
                &Attachments::new(),
            )
            .expect("batch");
        assert_eq!(report.applied, 1);
        assert_eq!(report.failures[0].code, "malformed_event");
        assert_eq!(b.progress("j").expect("progress").tasks.solved, 1);
    }

    #[test]
    fn mark_upsert_reaches_existing_jobs() {
        let b = bridge();
        open_job(&b, "j");
        b.apply_batch(
            "svc",
            "j",
            vec![json!({"type": "unknown", "id": "/v/p", "parent id": "/v", "problem desc": "p.txt"})],
            &{
                let mut files = Attachments::new();
                files.insert("p.txt", b"kernel panic in net_rx".to_vec());
                files
            },
        )
        .expect("batch");
        let change = b
            .upsert_mark(
                "panic",
                MarkType::Unknown,
                &json!({"attrs": [{"attr": "Module", "value": "net", "is_compare": true}],
                        "function": "panic in (\\w+)", "problem": "panic: {0}", "is_regexp": true}),
            )
            .expect("upsert");
        assert_eq!(change.version, Some(1));
        assert_eq!(change.associations.created, 1);
        let verdict = b.verdict("j", "/v/p").expect("verdict");
        assert_eq!(verdict.verdict.label(), "panic: net_rx");

        let change = b.delete_mark("panic").expect("delete");
        assert_eq!(change.associations.removed, 1);
        assert_eq!(b.verdict("j", "/v/p").expect("verdict").verdict.label(), "without marks");
        let err = b.delete_mark("panic").expect_err("gone");
        assert_eq!(error_code(&err), "unknown_mark");
    }

    #[test]
    fn confirm_needs_an_existing_association() {
        let b = bridge();
        open_job(&b, "j");
        b.apply_batch(
            "svc",
            "j",
            vec![json!({"type": "safe", "id": "/v/s", "parent id": "/v"})],
            &Attachments::new(),
        )
        .expect("batch");
        let err = b.confirm("svc", "j", "m", "/v/s").expect_err("no association");
        assert_eq!(error_code(&err), "no_association");
        let err = b.confirm("svc", "j", "m", "/v/x").expect_err("no report");
        assert_eq!(error_code(&err), "unknown_report");
        b.upsert_mark("m", MarkType::Safe, &json!({"attrs": [], "verdict": "incorrect_proof"}))
            .expect("mark");
        let a = b.confirm("svc", "j", "m", "/v/s").expect("confirm");
        assert_eq!(a.kind, AssociationKind::Confirmed);
    }

    #[test]
    fn error_code_reads_message_prefix() {
        assert_eq!(error_code(&anyhow!("state_locked: busy")), "state_locked");
        assert_eq!(error_code(&anyhow!("Something: else")), "command_failed");
        assert_eq!(error_code(&anyhow!("plain")), "command_failed");
    }

    #[test]
    fn events_from_value_accepts_object_or_list() {
        assert_eq!(events_from_value(json!({"type": "start"})).len(), 1);
        assert_eq!(events_from_value(json!([{}, {}])).len(), 2);
    }
}
