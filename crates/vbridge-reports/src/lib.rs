//! Report-tree ingestion: events, attribute interning, the per-job tree
//! builder, job states and progress counters.

mod attrs;
mod event;
mod progress;
mod status;
mod tree;

pub use attrs::{normalize_attrs, AttrId, AttrStore, NormalizedAttr, RawAttr, RawAttrValue, ReportAttr};
pub use event::{
    AttrsEvent, CoverageEvent, CoverageSpec, DataEvent, FinishEvent, ProgressEvent, ReportEvent,
    Resources, SafeEvent, StartEvent, UnknownEvent, UnsafeEvent,
};
pub use progress::{JobProgress, PhaseProgress, ProgressTracker, ProgressUpdate};
pub use status::JobStatus;
pub use tree::{
    derive_trace_id, ApplyContext, ApplyOutcome, ComponentData, LeafType, Report, ReportId,
    ReportKind, ReportTree,
};

pub const ROOT_PATH: &str = "/";
