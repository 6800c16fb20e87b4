use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::attrs::RawAttr;
use crate::progress::ProgressUpdate;

/// One entry of the report stream a verification pipeline uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReportEvent {
    #[serde(rename = "start")]
    Start(StartEvent),
    #[serde(rename = "finish")]
    Finish(FinishEvent),
    #[serde(rename = "attrs")]
    Attrs(AttrsEvent),
    #[serde(rename = "data")]
    Data(DataEvent),
    #[serde(rename = "verification", alias = "verification-start")]
    VerificationStart(StartEvent),
    #[serde(rename = "verification finish", alias = "verification-finish")]
    VerificationFinish(FinishEvent),
    #[serde(rename = "safe")]
    Safe(SafeEvent),
    #[serde(rename = "unsafe")]
    Unsafe(UnsafeEvent),
    #[serde(rename = "unknown")]
    Unknown(UnknownEvent),
    #[serde(rename = "job coverage", alias = "job-coverage")]
    JobCoverage(CoverageEvent),
    #[serde(rename = "progress")]
    Progress(ProgressEvent),
}

impl ReportEvent {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReportEvent::Start(_) => "start",
            ReportEvent::Finish(_) => "finish",
            ReportEvent::Attrs(_) => "attrs",
            ReportEvent::Data(_) => "data",
            ReportEvent::VerificationStart(_) => "verification",
            ReportEvent::VerificationFinish(_) => "verification finish",
            ReportEvent::Safe(_) => "safe",
            ReportEvent::Unsafe(_) => "unsafe",
            ReportEvent::Unknown(_) => "unknown",
            ReportEvent::JobCoverage(_) => "job coverage",
            ReportEvent::Progress(_) => "progress",
        }
    }

    /// Report path the event is about, when it names one.
    pub fn report_id(&self) -> Option<&str> {
        match self {
            ReportEvent::Start(e) | ReportEvent::VerificationStart(e) => Some(&e.id),
            ReportEvent::Finish(e) | ReportEvent::VerificationFinish(e) => Some(&e.id),
            ReportEvent::Attrs(e) => Some(&e.id),
            ReportEvent::Data(e) => Some(&e.id),
            ReportEvent::Safe(e) => Some(&e.id),
            ReportEvent::Unsafe(e) => Some(&e.id),
            ReportEvent::Unknown(e) => Some(&e.id),
            ReportEvent::JobCoverage(e) => Some(&e.id),
            ReportEvent::Progress(_) => None,
        }
    }

    /// A `start` of the root report opens a new decision.
    pub fn is_decision_start(&self) -> bool {
        matches!(self, ReportEvent::Start(e) if e.id == crate::ROOT_PATH)
    }

    pub fn progress(&self) -> Option<&ProgressUpdate> {
        match self {
            ReportEvent::Start(e) | ReportEvent::VerificationStart(e) => e.progress.as_ref(),
            ReportEvent::Safe(e) => e.progress.as_ref(),
            ReportEvent::Unsafe(e) => e.progress.as_ref(),
            ReportEvent::Unknown(e) => e.progress.as_ref(),
            ReportEvent::Progress(e) => Some(&e.progress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "cpu time", default)]
    pub cpu_time: u64,
    #[serde(rename = "wall time", default)]
    pub wall_time: u64,
    #[serde(rename = "memory size", default)]
    pub memory: u64,
}

/// Coverage is either one archive name or a map of logical name to archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoverageSpec {
    Single(String),
    Named(BTreeMap<String, String>),
}

impl CoverageSpec {
    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            CoverageSpec::Single(archive) => vec![(archive.clone(), archive.clone())],
            CoverageSpec::Named(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StartEvent {
    pub id: String,
    #[serde(rename = "parent id", default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attrs: Vec<RawAttr>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub comp: Option<Value>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(rename = "input files of static verifiers", alias = "verifier input", default)]
    pub verifier_input: Option<String>,
    #[serde(default)]
    pub coverage: Option<CoverageSpec>,
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinishEvent {
    pub id: String,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub attrs: Vec<RawAttr>,
    #[serde(default)]
    pub coverage: Option<CoverageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrsEvent {
    pub id: String,
    pub attrs: Vec<RawAttr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeEvent {
    pub id: String,
    #[serde(rename = "parent id")]
    pub parent: String,
    #[serde(default)]
    pub attrs: Vec<RawAttr>,
    #[serde(default)]
    pub proof: Option<String>,
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsafeEvent {
    pub id: String,
    #[serde(rename = "parent id")]
    pub parent: String,
    #[serde(default)]
    pub attrs: Vec<RawAttr>,
    #[serde(rename = "error traces", default)]
    pub error_traces: Vec<String>,
    #[serde(default)]
    pub sources: Option<String>,
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownEvent {
    pub id: String,
    #[serde(rename = "parent id")]
    pub parent: String,
    #[serde(default)]
    pub attrs: Vec<RawAttr>,
    #[serde(rename = "problem desc")]
    pub problem_desc: String,
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageEvent {
    #[serde(default = "root_path")]
    pub id: String,
    pub coverage: CoverageSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub progress: ProgressUpdate,
}

fn root_path() -> String {
    crate::ROOT_PATH.to_string()
}
