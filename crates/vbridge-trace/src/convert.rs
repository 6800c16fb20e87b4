use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ErrorTrace, NoteKind, StatementKind, TraceNode};
use crate::TraceError;

/// How a raw trace is reduced to a comparable sequence. Ids are the ones
/// stored in mark versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConversionFunction {
    /// Call tree restricted to calls whose subtree carries a check or warning.
    ModelFunctions,
    CallTree,
    Conditions,
    Assignments,
    PropertyChecks,
    Full,
}

impl ConversionFunction {
    pub const ALL: [ConversionFunction; 6] = [
        ConversionFunction::ModelFunctions,
        ConversionFunction::CallTree,
        ConversionFunction::Conditions,
        ConversionFunction::Assignments,
        ConversionFunction::PropertyChecks,
        ConversionFunction::Full,
    ];

    pub fn id(self) -> u8 {
        match self {
            ConversionFunction::ModelFunctions => 0,
            ConversionFunction::CallTree => 1,
            ConversionFunction::Conditions => 2,
            ConversionFunction::Assignments => 3,
            ConversionFunction::PropertyChecks => 4,
            ConversionFunction::Full => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConversionFunction::ModelFunctions => "model_functions",
            ConversionFunction::CallTree => "call_tree",
            ConversionFunction::Conditions => "conditions",
            ConversionFunction::Assignments => "assignments",
            ConversionFunction::PropertyChecks => "property_checks",
            ConversionFunction::Full => "full",
        }
    }
}

impl Default for ConversionFunction {
    fn default() -> Self {
        ConversionFunction::ModelFunctions
    }
}

impl TryFrom<u8> for ConversionFunction {
    type Error = TraceError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        ConversionFunction::ALL
            .into_iter()
            .find(|f| f.id() == id)
            .ok_or(TraceError::UnknownConversion(id))
    }
}

impl From<ConversionFunction> for u8 {
    fn from(f: ConversionFunction) -> u8 {
        f.id()
    }
}

/// Canonical form of a trace. Equal inputs always give byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvertedTrace(Vec<String>);

impl ConvertedTrace {
    pub fn new(elements: Vec<String>) -> Self {
        Self(elements)
    }

    pub fn elements(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl FromIterator<String> for ConvertedTrace {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn convert(trace: &ErrorTrace, function: ConversionFunction) -> ConvertedTrace {
    let mut out = Vec::new();
    match function {
        ConversionFunction::ModelFunctions => {
            call_tree(&trace.root, true, &mut out);
        }
        ConversionFunction::CallTree => {
            call_tree(&trace.root, false, &mut out);
        }
        ConversionFunction::Conditions => trace.root.walk(&mut |node| {
            if let TraceNode::Statement {
                source,
                kind: StatementKind::Condition,
                ..
            } = node
            {
                out.push(normalize(source));
            }
        }),
        ConversionFunction::Assignments => trace.root.walk(&mut |node| {
            if let TraceNode::Statement {
                source,
                kind: StatementKind::Assignment,
                ..
            } = node
            {
                out.push(normalize(source));
            }
        }),
        ConversionFunction::PropertyChecks => trace.root.walk(&mut |node| {
            for note in node.notes() {
                match note.kind {
                    NoteKind::Check => out.push(normalize(&note.text)),
                    NoteKind::Warning => out.push(format!("warning: {}", normalize(&note.text))),
                    NoteKind::Info(_) => {}
                }
            }
        }),
        ConversionFunction::Full => full(&trace.root, &mut out),
    }
    ConvertedTrace(out)
}

pub fn convert_raw(bytes: &[u8], function: ConversionFunction) -> Result<ConvertedTrace, TraceError> {
    let trace = ErrorTrace::from_slice(bytes)?;
    let converted = convert(&trace, function);
    debug!(conversion = function.name(), items = converted.len(), "converted error trace");
    Ok(converted)
}

/// Emits `call f` / `return f` pairs. With `model_only`, a call is kept only
/// when it or something beneath it carries a check or a warning; the return
/// value reports whether that was the case for `node`.
fn call_tree(node: &TraceNode, model_only: bool, out: &mut Vec<String>) -> bool {
    let own = node
        .notes()
        .iter()
        .any(|n| matches!(n.kind, NoteKind::Check | NoteKind::Warning));
    match node {
        TraceNode::Call { func, children, .. } => {
            let mark = out.len();
            out.push(format!("call {}", func));
            let mut relevant = own;
            for child in children {
                relevant |= call_tree(child, model_only, out);
            }
            if model_only && !relevant {
                out.truncate(mark);
            } else {
                out.push(format!("return {}", func));
            }
            relevant
        }
        _ => {
            let mut relevant = own;
            for child in node.children() {
                relevant |= call_tree(child, model_only, out);
            }
            relevant
        }
    }
}

fn full(node: &TraceNode, out: &mut Vec<String>) {
    match node {
        TraceNode::Thread { .. } => out.push("thread".to_string()),
        TraceNode::Action { display, .. } => out.push(format!("action {}", normalize(display))),
        TraceNode::Call { func, .. } => out.push(format!("call {}", func)),
        TraceNode::Statement {
            source,
            kind,
            assumption,
            ..
        } => {
            let prefix = match kind {
                StatementKind::Condition => "cond",
                StatementKind::Assignment | StatementKind::Other => "stmt",
            };
            out.push(format!("{} {}", prefix, normalize(source)));
            if let Some(assumption) = assumption {
                out.push(format!("assume {}", normalize(assumption)));
            }
        }
    }
    for note in node.notes() {
        let label = match note.kind {
            NoteKind::Check => "check",
            NoteKind::Info(_) => "note",
            NoteKind::Warning => "warning",
        };
        out.push(format!("{} {}", label, normalize(&note.text)));
    }
    for child in node.children() {
        full(child, out);
    }
    if let TraceNode::Call { func, .. } = node {
        out.push(format!("return {}", func));
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
