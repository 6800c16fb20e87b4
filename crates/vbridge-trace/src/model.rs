use serde::Deserialize;
use serde_json::Value;

use crate::TraceError;

const SUPPORTED_FORMAT: u64 = 1;

#[derive(Debug, Deserialize)]
struct RawTrace {
    #[serde(default)]
    format: Option<u64>,
    #[serde(default)]
    funcs: Vec<String>,
    trace: RawNode,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawNode {
    #[serde(rename = "thread")]
    Thread {
        #[serde(default)]
        thread: u64,
        #[serde(default)]
        children: Vec<RawNode>,
    },
    #[serde(rename = "action")]
    Action {
        #[serde(default)]
        display: String,
        #[serde(default)]
        children: Vec<RawNode>,
    },
    #[serde(rename = "function call")]
    Call {
        func: usize,
        #[serde(default)]
        source: String,
        #[serde(default)]
        children: Vec<RawNode>,
        #[serde(default)]
        notes: Vec<RawNote>,
        #[serde(default)]
        warnings: Vec<RawNote>,
    },
    #[serde(rename = "statement", alias = "declaration")]
    Statement {
        #[serde(default)]
        source: String,
        #[serde(default)]
        condition: bool,
        #[serde(default)]
        assumption: Option<String>,
        #[serde(default)]
        notes: Vec<RawNote>,
        #[serde(default)]
        warnings: Vec<RawNote>,
    },
}

#[derive(Debug, Deserialize)]
struct RawNote {
    text: String,
    #[serde(default)]
    level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    /// Level-0 note: a property check that held at this point.
    Check,
    Info(u8),
    /// The property violation the trace leads to.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub text: String,
    pub kind: NoteKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Condition,
    Assignment,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceNode {
    Thread {
        id: u64,
        children: Vec<TraceNode>,
    },
    Action {
        display: String,
        children: Vec<TraceNode>,
    },
    Call {
        func: String,
        source: String,
        children: Vec<TraceNode>,
        notes: Vec<Note>,
    },
    Statement {
        source: String,
        kind: StatementKind,
        assumption: Option<String>,
        notes: Vec<Note>,
    },
}

impl TraceNode {
    pub fn children(&self) -> &[TraceNode] {
        match self {
            TraceNode::Thread { children, .. }
            | TraceNode::Action { children, .. }
            | TraceNode::Call { children, .. } => children,
            TraceNode::Statement { .. } => &[],
        }
    }

    pub fn notes(&self) -> &[Note] {
        match self {
            TraceNode::Call { notes, .. } | TraceNode::Statement { notes, .. } => notes,
            TraceNode::Thread { .. } | TraceNode::Action { .. } => &[],
        }
    }

    /// Pre-order traversal.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TraceNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }
}

/// A parsed error trace with function indices resolved to names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTrace {
    pub format: u64,
    pub root: TraceNode,
}

impl ErrorTrace {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TraceError> {
        let raw: RawTrace =
            serde_json::from_slice(bytes).map_err(|e| TraceError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_value(value: &Value) -> Result<Self, TraceError> {
        let raw = RawTrace::deserialize(value).map_err(|e| TraceError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawTrace) -> Result<Self, TraceError> {
        let format = raw.format.unwrap_or(SUPPORTED_FORMAT);
        if format != SUPPORTED_FORMAT {
            return Err(TraceError::UnsupportedFormat(format));
        }
        let root = resolve_node(raw.trace, &raw.funcs)?;
        Ok(Self { format, root })
    }
}

fn resolve_node(node: RawNode, funcs: &[String]) -> Result<TraceNode, TraceError> {
    let resolve_children = |children: Vec<RawNode>| -> Result<Vec<TraceNode>, TraceError> {
        children
            .into_iter()
            .map(|c| resolve_node(c, funcs))
            .collect()
    };
    Ok(match node {
        RawNode::Thread { thread, children } => TraceNode::Thread {
            id: thread,
            children: resolve_children(children)?,
        },
        RawNode::Action { display, children } => TraceNode::Action {
            display,
            children: resolve_children(children)?,
        },
        RawNode::Call {
            func,
            source,
            children,
            notes,
            warnings,
        } => {
            let name = funcs
                .get(func)
                .cloned()
                .ok_or(TraceError::UnknownFunction(func))?;
            TraceNode::Call {
                func: name,
                source,
                children: resolve_children(children)?,
                notes: resolve_notes(notes, warnings),
            }
        }
        RawNode::Statement {
            source,
            condition,
            assumption,
            notes,
            warnings,
        } => {
            let kind = if condition {
                StatementKind::Condition
            } else if is_assignment(&source) {
                StatementKind::Assignment
            } else {
                StatementKind::Other
            };
            TraceNode::Statement {
                source,
                kind,
                assumption,
                notes: resolve_notes(notes, warnings),
            }
        }
    })
}

fn resolve_notes(notes: Vec<RawNote>, warnings: Vec<RawNote>) -> Vec<Note> {
    let mut out: Vec<Note> = notes
        .into_iter()
        .map(|n| Note {
            text: n.text,
            kind: if n.level == 0 {
                NoteKind::Check
            } else {
                NoteKind::Info(n.level)
            },
        })
        .collect();
    out.extend(warnings.into_iter().map(|w| Note {
        text: w.text,
        kind: NoteKind::Warning,
    }));
    out
}

/// True for `a = b`, `a += b` and friends; false for `==`, `!=`, `<=`, `>=`.
fn is_assignment(source: &str) -> bool {
    let bytes = source.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'=' {
            continue;
        }
        let prev = if i > 0 { bytes[i - 1] } else { b' ' };
        let next = bytes.get(i + 1).copied().unwrap_or(b' ');
        if next == b'=' || matches!(prev, b'=' | b'!' | b'<' | b'>') {
            continue;
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignment_detection_skips_comparisons() {
        assert!(is_assignment("x = 1;"));
        assert!(is_assignment("counter += step;"));
        assert!(!is_assignment("if (a == b)"));
        assert!(!is_assignment("a != b"));
        assert!(!is_assignment("a <= b && c >= d"));
        assert!(!is_assignment("call(x)"));
    }

    #[test]
    fn function_indices_are_resolved() {
        let trace = ErrorTrace::from_value(&json!({
            "funcs": ["main"],
            "trace": {"type": "function call", "func": 0, "children": [
                {"type": "statement", "source": "ret = 0;", "notes": [{"text": "n", "level": 2}]}
            ]}
        }))
        .expect("valid trace");
        match &trace.root {
            TraceNode::Call { func, children, .. } => {
                assert_eq!(func, "main");
                assert_eq!(children[0].notes()[0].kind, NoteKind::Info(2));
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn out_of_range_function_is_rejected() {
        let err = ErrorTrace::from_value(&json!({
            "funcs": [],
            "trace": {"type": "function call", "func": 3}
        }))
        .expect_err("bad index");
        assert_eq!(err, TraceError::UnknownFunction(3));
    }

    #[test]
    fn unknown_node_type_and_format_are_rejected() {
        let err = ErrorTrace::from_slice(br#"{"trace": {"type": "loop"}}"#).expect_err("bad type");
        assert!(matches!(err, TraceError::Malformed(_)));
        let err = ErrorTrace::from_value(&json!({"format": 7, "trace": {"type": "thread"}}))
            .expect_err("bad format");
        assert_eq!(err, TraceError::UnsupportedFormat(7));
    }
}
