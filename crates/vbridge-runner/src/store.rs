use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vbridge_core::{atomic_write_json_pretty, ensure_dir, load_json_file, BridgeError};
use vbridge_marks::{AssociationSet, MarkStore};
use vbridge_reports::{AttrStore, JobProgress, JobStatus, ReportTree};

const JOBS_DIR: &str = "jobs";
const ATTRS_FILE: &str = "attrs.json";
const MARKS_FILE: &str = "marks.json";
const LOCK_FILE: &str = "bridge.lock";

/// Everything kept about one job between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: String,
    pub status: JobStatus,
    pub tree: ReportTree,
    pub associations: AssociationSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    pub saved_at: DateTime<Utc>,
}

/// On-disk layout of the bridge state:
/// `jobs/<job>.json`, `attrs.json` and `marks.json`.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, job: &str) -> PathBuf {
        self.root.join(JOBS_DIR).join(format!("{}.json", job))
    }

    pub fn save_job(&self, snapshot: &JobSnapshot) -> Result<(), BridgeError> {
        write_json(&self.job_path(&snapshot.job), snapshot)
    }

    pub fn save_attrs(&self, attrs: &AttrStore) -> Result<(), BridgeError> {
        write_json(&self.root.join(ATTRS_FILE), attrs)
    }

    pub fn save_marks(&self, marks: &MarkStore) -> Result<(), BridgeError> {
        write_json(&self.root.join(MARKS_FILE), marks)
    }

    pub fn load_attrs(&self) -> Result<Option<AttrStore>, BridgeError> {
        read_json(&self.root.join(ATTRS_FILE))
    }

    pub fn load_marks(&self) -> Result<Option<MarkStore>, BridgeError> {
        read_json(&self.root.join(MARKS_FILE))
    }

    /// All job snapshots. A file that does not parse is skipped with a
    /// warning so one corrupt job does not block the others.
    pub fn load_jobs(&self) -> Result<Vec<JobSnapshot>, BridgeError> {
        let dir = self.root.join(JOBS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| BridgeError::Storage(format!("{}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        paths.sort();
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<JobSnapshot>(&path) {
                Ok(Some(snapshot)) => out.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "job snapshot skipped"),
            }
        }
        Ok(out)
    }

    /// Exclusive use of the state directory by one process.
    pub fn lock(&self) -> Result<StateLock> {
        let lock_path = self.root.join(LOCK_FILE);
        ensure_dir(&self.root)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                Ok(StateLock { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
                "state_locked: {} is in use by another bridge process",
                self.root.display()
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Job ids become file names, so they are kept to a safe alphabet.
pub fn check_job_id(job: &str) -> Result<(), BridgeError> {
    let ok = !job.is_empty()
        && !job.starts_with('.')
        && job
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(BridgeError::malformed(format!("invalid job id '{}'", job)))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BridgeError> {
    let value = serde_json::to_value(value)
        .map_err(|e| BridgeError::Storage(format!("{}: {}", path.display(), e)))?;
    atomic_write_json_pretty(path, &value)
        .map_err(|e| BridgeError::Storage(format!("{}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "state written");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let value = load_json_file(path)
        .map_err(|e| BridgeError::Storage(format!("{}: {}", path.display(), e)))?;
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| BridgeError::Storage(format!("{}: {}", path.display(), e)))
}
