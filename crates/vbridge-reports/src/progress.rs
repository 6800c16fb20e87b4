use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use vbridge_core::IngestionError;

/// Counters a pipeline reports for its tasks and sub-jobs. Every field is
/// optional; absent fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(rename = "total tasks to be generated", default, skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<u64>,
    #[serde(rename = "failed tasks", default, skip_serializing_if = "Option::is_none")]
    pub failed_tasks: Option<u64>,
    #[serde(rename = "solved tasks", default, skip_serializing_if = "Option::is_none")]
    pub solved_tasks: Option<u64>,
    #[serde(rename = "expected time for solving tasks", default, skip_serializing_if = "Option::is_none")]
    pub expected_time_tasks: Option<u64>,
    #[serde(rename = "start tasks solution", default)]
    pub start_tasks: bool,
    #[serde(rename = "finish tasks solution", default)]
    pub finish_tasks: bool,
    #[serde(rename = "total subjobs to be solved", default, skip_serializing_if = "Option::is_none")]
    pub total_subjobs: Option<u64>,
    #[serde(rename = "failed subjobs", default, skip_serializing_if = "Option::is_none")]
    pub failed_subjobs: Option<u64>,
    #[serde(rename = "solved subjobs", default, skip_serializing_if = "Option::is_none")]
    pub solved_subjobs: Option<u64>,
    #[serde(rename = "expected time for solving subjobs", default, skip_serializing_if = "Option::is_none")]
    pub expected_time_subjobs: Option<u64>,
    #[serde(rename = "start subjobs solution", default)]
    pub start_subjobs: bool,
    #[serde(rename = "finish subjobs solution", default)]
    pub finish_subjobs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub total: Option<u64>,
    pub failed: u64,
    pub solved: u64,
    pub expected_time: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct PhaseUpdate {
    total: Option<u64>,
    failed: Option<u64>,
    solved: Option<u64>,
    expected_time: Option<u64>,
    start: bool,
    finish: bool,
}

impl ProgressUpdate {
    fn tasks(&self) -> PhaseUpdate {
        PhaseUpdate {
            total: self.total_tasks,
            failed: self.failed_tasks,
            solved: self.solved_tasks,
            expected_time: self.expected_time_tasks,
            start: self.start_tasks,
            finish: self.finish_tasks,
        }
    }

    fn subjobs(&self) -> PhaseUpdate {
        PhaseUpdate {
            total: self.total_subjobs,
            failed: self.failed_subjobs,
            solved: self.solved_subjobs,
            expected_time: self.expected_time_subjobs,
            start: self.start_subjobs,
            finish: self.finish_subjobs,
        }
    }
}

impl PhaseProgress {
    fn apply(
        &self,
        phase: &str,
        update: PhaseUpdate,
        now: DateTime<Utc>,
    ) -> Result<PhaseProgress, IngestionError> {
        let PhaseUpdate {
            total,
            failed,
            solved,
            expected_time,
            start,
            finish,
        } = update;
        let mut next = self.clone();
        if start {
            if next.started_at.is_some() {
                return Err(IngestionError::Malformed(format!(
                    "{} solution was already started",
                    phase
                )));
            }
            next.started_at = Some(now);
        }
        if total.is_some() {
            next.total = total;
        }
        next.failed = failed.unwrap_or(next.failed);
        next.solved = solved.unwrap_or(next.solved);
        if expected_time.is_some() {
            next.expected_time = expected_time;
        }
        if let Some(total) = next.total {
            if next.failed + next.solved > total {
                return Err(IngestionError::Malformed(format!(
                    "{} counters exceed total: {} failed + {} solved > {}",
                    phase, next.failed, next.solved, total
                )));
            }
        }
        if finish {
            if next.started_at.is_none() {
                return Err(IngestionError::Malformed(format!(
                    "{} solution finished before it started",
                    phase
                )));
            }
            next.finished_at = Some(now);
            next.expected_time = Some(0);
        }
        Ok(next)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub tasks: PhaseProgress,
    pub subjobs: PhaseProgress,
}

/// Per-job progress table. Updates are all-or-nothing per call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressTracker {
    jobs: BTreeMap<String, JobProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job: &str) -> Option<&JobProgress> {
        self.jobs.get(job)
    }

    pub fn reset(&mut self, job: &str) {
        self.jobs.remove(job);
    }

    pub fn insert(&mut self, job: &str, progress: JobProgress) {
        self.jobs.insert(job.to_string(), progress);
    }

    pub fn update(
        &mut self,
        job: &str,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<&JobProgress, IngestionError> {
        let current = self.jobs.get(job).cloned().unwrap_or_default();
        let tasks = current.tasks.apply("tasks", update.tasks(), now)?;
        let subjobs = current.subjobs.apply("subjobs", update.subjobs(), now)?;
        debug!(
            job,
            tasks_solved = tasks.solved,
            subjobs_solved = subjobs.solved,
            "progress updated"
        );
        let entry = self.jobs.entry(job.to_string()).or_default();
        *entry = JobProgress { tasks, subjobs };
        Ok(entry)
    }
}
