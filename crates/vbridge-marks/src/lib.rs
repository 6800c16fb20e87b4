//! Marks, their association with report leaves, and the verdicts that
//! follow from those associations.

mod association;
mod filter;
mod import;
mod mark;
mod verdict;

pub use association::{
    Association, AssociationEngine, AssociationKind, AssociationSet, ConnectScope, ConnectStats,
};
pub use filter::{AttrFilter, ProblemMatcher};
pub use import::{read_mark_archive, read_mark_bytes, read_mark_preset, MarkDocument};
pub use mark::{
    AttrOperator, AttrPattern, Mark, MarkPayload, MarkStore, MarkType, MarkVersion, SafeVerdict,
    UnsafeVerdict,
};
pub use verdict::{leaf_verdict, JobSummary, LeafVerdict, Verdict, VerdictCounts, INCOMPATIBLE, WITHOUT_MARKS};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkError {
    #[error("invalid_mark: {0}")]
    Invalid(String),
    #[error("unknown_mark: mark '{0}' does not exist")]
    Unknown(String),
    #[error("mark_not_modifiable: mark '{0}' can not be edited")]
    NotModifiable(String),
    #[error("no_association: mark '{mark}' is not associated with report {report}")]
    NoAssociation { mark: String, report: usize },
    #[error("mark_archive: {0}")]
    Archive(String),
}

impl MarkError {
    pub fn code(&self) -> &'static str {
        match self {
            MarkError::Invalid(_) => "invalid_mark",
            MarkError::Unknown(_) => "unknown_mark",
            MarkError::NotModifiable(_) => "mark_not_modifiable",
            MarkError::NoAssociation { .. } => "no_association",
            MarkError::Archive(_) => "mark_archive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::io::Write;
    use vbridge_core::{Attachments, MemoryBlobStore};
    use vbridge_reports::{ApplyContext, AttrStore, ReportEvent, ReportId, ReportTree};
    use vbridge_trace::{ComparisonFunction, ConversionFunction, ConvertedTrace};

    const CALLS: [&str; 4] = ["call main", "call lock", "return lock", "return main"];

    fn raw_trace() -> Value {
        json!({
            "format": 1,
            "funcs": ["main", "lock"],
            "trace": {"type": "thread", "thread": 1, "children": [
                {"type": "function call", "func": 0, "children": [
                    {"type": "function call", "func": 1, "children": [
                        {"type": "statement", "source": "assert(!locked)",
                         "warnings": [{"text": "double lock"}]}
                    ]}
                ]}
            ]}
        })
    }

    struct Job {
        tree: ReportTree,
        attrs: AttrStore,
        blobs: MemoryBlobStore,
        associations: AssociationSet,
    }

    impl Job {
        fn new() -> Self {
            let mut files = Attachments::new();
            files.insert("good.json", serde_json::to_vec(&raw_trace()).expect("trace"));
            files.insert("bad.json", b"{not json".to_vec());
            files.insert("problem.txt", b"Fatal: out of memory in module net".to_vec());
            let mut job = Job {
                tree: ReportTree::new("job-1"),
                attrs: AttrStore::new(),
                blobs: MemoryBlobStore::new(),
                associations: AssociationSet::new(),
            };
            let attrs = parking_lot::RwLock::new(AttrStore::new());
            for event in [
                json!({"type": "start", "id": "/", "attrs": [{"name": "Program fragment", "value": "drivers/net.ko", "compare": true}, {"name": "Version", "value": "10"}]}),
                json!({"type": "verification", "id": "/v", "parent id": "/"}),
                json!({"type": "unsafe", "id": "/v/u1", "parent id": "/v", "error traces": ["good.json"]}),
                json!({"type": "unsafe", "id": "/v/u2", "parent id": "/v", "error traces": ["bad.json"]}),
                json!({"type": "unknown", "id": "/v/p", "parent id": "/v", "problem desc": "problem.txt"}),
                json!({"type": "safe", "id": "/v/s", "parent id": "/v"}),
            ] {
                let event = ReportEvent::from_value(event).expect("event");
                let ctx = ApplyContext {
                    resolver: &files,
                    blobs: &job.blobs,
                    attrs: &attrs,
                    now: Utc::now(),
                };
                job.tree.apply(&event, &ctx).expect("apply");
            }
            job.attrs = attrs.into_inner();
            job
        }

        fn id(&self, path: &str) -> ReportId {
            self.tree.find(path).expect("report").id
        }

        fn connect(&mut self, engine: &AssociationEngine, marks: &MarkStore, scope: ConnectScope<'_>) -> ConnectStats {
            engine.connect(&self.tree, &self.attrs, marks, &self.blobs, &mut self.associations, scope)
        }

        fn verdict(&self, path: &str, marks: &MarkStore) -> LeafVerdict {
            leaf_verdict(&self.tree, self.id(path), &self.associations, marks).expect("leaf")
        }
    }

    fn version(attrs: Vec<AttrPattern>, payload: MarkPayload) -> MarkVersion {
        MarkVersion {
            version: 0,
            attrs,
            edited_at: Utc::now(),
            status: None,
            comment: None,
            description: None,
            payload,
        }
    }

    fn unsafe_payload(
        verdict: UnsafeVerdict,
        comparison: ComparisonFunction,
        threshold: f64,
        trace: &[&str],
    ) -> MarkPayload {
        MarkPayload::Unsafe {
            verdict,
            tags: vec![format!("{:?}", verdict)],
            conversion: ConversionFunction::CallTree,
            comparison,
            threshold,
            error_trace: trace.iter().map(|s| s.to_string()).collect::<ConvertedTrace>(),
        }
    }

    fn pattern(attr: &str, value: &str, op: AttrOperator, is_compare: bool) -> AttrPattern {
        AttrPattern {
            attr: attr.to_string(),
            value: value.to_string(),
            op,
            is_compare,
        }
    }

    #[test]
    fn attr_filter_operators() {
        let attrs: BTreeMap<String, String> = [("Version", "10"), ("Name", "net")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let ok = |p: AttrPattern| AttrFilter::compile(&[p]).expect("compile").matches(&attrs);
        assert!(ok(pattern("Version", "9", AttrOperator::Gt, true)));
        assert!(!ok(pattern("Version", "9", AttrOperator::Lt, true)));
        assert!(ok(pattern("Name", "nfs", AttrOperator::Lt, true)));
        assert!(ok(pattern("Name", "^ne", AttrOperator::Re, true)));
        assert!(ok(pattern("Name", "usb", AttrOperator::Ne, true)));
        assert!(ok(pattern("Version", "10", AttrOperator::Ge, true)));
        assert!(!ok(pattern("Absent", "x", AttrOperator::Eq, true)));
        assert!(ok(pattern("Absent", "x", AttrOperator::Eq, false)));
        assert!(!ok(pattern("Name", "usb", AttrOperator::Eq, false)));
        assert!(AttrFilter::compile(&[pattern("Name", "(", AttrOperator::Re, true)]).is_err());
    }

    #[test]
    fn problem_labels_take_capture_groups() {
        let m = ProblemMatcher::compile(r"out of memory in module (\w+)", "OOM in {0}", true)
            .expect("regex");
        assert_eq!(
            m.label("Fatal: out of memory in module net").as_deref(),
            Some("OOM in net")
        );
        assert!(m.label("segfault").is_none());
        let plain = ProblemMatcher::compile("out of memory", "OOM", false).expect("plain");
        assert_eq!(plain.label("x out of memory y").as_deref(), Some("OOM"));
    }

    #[test]
    fn captured_braces_are_not_substituted_again() {
        let m = ProblemMatcher::compile(r"assert (\S+) failed at (\w+)", "{0} in {1} ({2})", true)
            .expect("regex");
        assert_eq!(
            m.label("assert x{1} failed at probe_net").as_deref(),
            Some("x{1} in probe_net ({2})")
        );
    }

    #[test]
    fn connect_is_idempotent() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("m1", version(vec![pattern("Program fragment", "drivers/net.ko", AttrOperator::Eq, true)],
                unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Equal, 1.0, &CALLS)))
            .expect("mark");
        let engine = AssociationEngine::new();
        let first = job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(first.created, 1);
        assert_eq!(first.errors, 1, "unparsable trace is one rejected pair");
        let snapshot = serde_json::to_value(&job.associations).expect("ser");
        let second = job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(second.created + second.removed + second.refreshed, 0);
        assert_eq!(serde_json::to_value(&job.associations).expect("ser"), snapshot);
        assert_eq!(engine.cached_traces(), 1);
        assert_eq!(job.verdict("/v/u1", &marks).verdict, Verdict::Unsafe(UnsafeVerdict::Bug));
        assert_eq!(job.verdict("/v/u2", &marks).verdict, Verdict::WithoutMarks);
    }

    #[test]
    fn forgotten_job_leaves_no_cached_traces() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("m1", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Equal, 1.0, &CALLS)))
            .expect("mark");
        let engine = AssociationEngine::new();
        job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(engine.cached_traces(), 1);
        engine.forget_job("job-2");
        assert_eq!(engine.cached_traces(), 1);
        engine.forget_job("job-1");
        assert_eq!(engine.cached_traces(), 0);

        let again = job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(again.created + again.removed, 0);
        assert_eq!(engine.cached_traces(), 1);
    }

    #[test]
    fn threshold_boundary_matches() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        let partial = ["call main", "call lock", "return lock", "call other"];
        marks
            .upsert("at", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::IncludeAll, 0.75, &partial)))
            .expect("mark");
        marks
            .upsert("above", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::IncludeAll, 0.76, &partial)))
            .expect("mark");
        let engine = AssociationEngine::new();
        job.connect(&engine, &marks, ConnectScope::All);
        let u1 = job.id("/v/u1");
        assert_eq!(job.associations.get("at", u1).map(|a| a.similarity), Some(0.75));
        assert!(job.associations.get("above", u1).is_none());
    }

    #[test]
    fn skip_comparison_always_matches() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("skip", version(vec![], unsafe_payload(UnsafeVerdict::FalsePositive, ComparisonFunction::Skip, 1.0, &[])))
            .expect("mark");
        let engine = AssociationEngine::new();
        let stats = job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(stats.created, 2, "both unsafes, including the unparsable trace");
        assert_eq!(stats.errors, 0);
        assert_eq!(engine.cached_traces(), 0);
    }

    #[test]
    fn confirmed_beats_conflicting_automatics() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("bug", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Equal, 1.0, &CALLS)))
            .expect("mark");
        marks
            .upsert("fp", version(vec![], unsafe_payload(UnsafeVerdict::FalsePositive, ComparisonFunction::Include, 1.0, &CALLS[1..3])))
            .expect("mark");
        let engine = AssociationEngine::new();
        job.connect(&engine, &marks, ConnectScope::All);
        let u1 = job.id("/v/u1");
        assert_eq!(job.verdict("/v/u1", &marks).verdict, Verdict::Incompatible);

        job.associations
            .set_kind("fp", u1, AssociationKind::Confirmed)
            .expect("confirm");
        let v = job.verdict("/v/u1", &marks);
        assert_eq!(v.verdict, Verdict::Unsafe(UnsafeVerdict::FalsePositive));
        assert_eq!(v.primary_mark.as_deref(), Some("fp"));
        assert_eq!(v.tags.len(), 2, "tags are the union over all associations");

        let stats = job.connect(&engine, &marks, ConnectScope::Reports(&[u1]));
        assert_eq!(stats.created + stats.removed, 0);
        assert_eq!(
            job.associations.get("fp", u1).map(|a| a.kind),
            Some(AssociationKind::Confirmed)
        );
    }

    #[test]
    fn edited_mark_drops_stale_automatic_associations() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("m", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Equal, 1.0, &CALLS)))
            .expect("mark");
        let engine = AssociationEngine::new();
        job.connect(&engine, &marks, ConnectScope::All);
        assert_eq!(job.associations.len(), 1);

        let edited = marks
            .upsert("m", version(vec![pattern("Version", "11", AttrOperator::Ge, true)],
                unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Equal, 1.0, &CALLS)))
            .expect("edit");
        assert_eq!(edited.version_number(), 2);
        let stats = job.connect(&engine, &marks, ConnectScope::Marks(&["m".to_string()]));
        assert_eq!(stats.removed, 1);
        assert!(job.associations.is_empty());

        marks.remove("m").expect("remove");
        job.associations = AssociationSet::new();
        let stats = job.connect(&engine, &marks, ConnectScope::Marks(&["m".to_string()]));
        assert_eq!(stats.pairs, 0);
    }

    #[test]
    fn unknown_marks_label_problems_and_summary_rolls_up() {
        let mut job = Job::new();
        let mut marks = MarkStore::new();
        marks
            .upsert("oom", version(vec![], MarkPayload::Unknown {
                function: r"out of memory in module (\w+)".to_string(),
                problem: "OOM({0})".to_string(),
                is_regexp: true,
                link: None,
            }))
            .expect("mark");
        marks
            .upsert("safe", version(vec![], MarkPayload::Safe {
                verdict: SafeVerdict::IncorrectProof,
                tags: vec!["proof".to_string()],
            }))
            .expect("mark");
        let engine = AssociationEngine::new();
        job.connect(&engine, &marks, ConnectScope::All);

        let v = job.verdict("/v/p", &marks);
        assert_eq!(
            v.verdict,
            Verdict::Problems(["OOM(net)".to_string()].into_iter().collect())
        );
        let summary = JobSummary::compute(&job.tree, None, &job.associations, &marks);
        assert_eq!(summary.report, "/");
        assert_eq!(summary.unknowns.verdicts.get("OOM(net)"), Some(&1));
        assert_eq!(summary.safes.verdicts.get("incorrect_proof"), Some(&1));
        assert_eq!(summary.safes.tags.get("proof"), Some(&1));
        assert_eq!(summary.unsafes.total, 2);
        assert_eq!(summary.unsafes.verdicts.get(WITHOUT_MARKS), Some(&2));
    }

    #[test]
    fn mark_store_versions_and_modifiability() {
        let mut marks = MarkStore::new();
        let payload = MarkPayload::Safe {
            verdict: SafeVerdict::Unknown,
            tags: vec![],
        };
        marks.upsert("s", version(vec![], payload.clone())).expect("create");
        let m = marks.upsert("s", version(vec![], payload.clone())).expect("edit");
        assert_eq!(m.version_number(), 2);
        let err = marks
            .upsert("s", version(vec![], unsafe_payload(UnsafeVerdict::Bug, ComparisonFunction::Skip, 1.0, &[])))
            .expect_err("type change");
        assert_eq!(err.code(), "invalid_mark");

        let mut locked = Mark::new("locked", version(vec![], payload.clone()));
        locked.is_modifiable = false;
        marks.replace(locked).expect("replace");
        let err = marks.upsert("locked", version(vec![], payload)).expect_err("locked");
        assert_eq!(err, MarkError::NotModifiable("locked".to_string()));
    }

    #[test]
    fn preset_with_raw_trace_is_converted() {
        let preset = json!({
            "identifier": "preset-1",
            "mark_type": "unsafe",
            "attrs": [{"attr": "Program fragment", "value": "drivers/net.ko", "is_compare": true}],
            "verdict": "1",
            "conversion_function": 1,
            "comparison_function": 0,
            "raw_error_trace": raw_trace()
        });
        let mark = read_mark_preset(&preset, Utc::now()).expect("preset");
        match &mark.current().expect("version").payload {
            MarkPayload::Unsafe { verdict, error_trace, threshold, .. } => {
                assert_eq!(*verdict, UnsafeVerdict::Bug);
                assert_eq!(error_trace.elements(), &CALLS.map(String::from));
                assert_eq!(*threshold, 1.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        let err = read_mark_preset(&json!({"identifier": "x", "mark_type": "unsafe", "attrs": []}), Utc::now())
            .expect_err("no trace");
        assert_eq!(err.code(), "invalid_mark");
    }

    #[test]
    fn mark_archive_keeps_version_history() {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            zip.start_file("mark/markdata", options).expect("markdata");
            zip.write_all(br#"{"identifier": "zip-1", "mark_type": "unknown", "is_modifiable": false, "format": 1}"#)
                .expect("write");
            for (n, problem) in [(1, "OOM"), (2, "Out of memory")] {
                zip.start_file(format!("mark/version-{}", n), options).expect("version");
                let doc = json!({"attrs": [], "function": "out of memory", "problem": problem});
                zip.write_all(&serde_json::to_vec(&doc).expect("doc")).expect("write");
            }
            zip.finish().expect("finish");
        }
        let mark = read_mark_bytes(buf.get_ref(), Utc::now()).expect("archive");
        assert_eq!(mark.identifier, "zip-1");
        assert!(!mark.is_modifiable);
        assert_eq!(mark.versions.len(), 2);
        assert_eq!(mark.version_number(), 2);
        match &mark.current().expect("version").payload {
            MarkPayload::Unknown { problem, .. } => assert_eq!(problem, "Out of memory"),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
