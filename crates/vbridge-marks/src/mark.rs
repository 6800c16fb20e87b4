use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vbridge_reports::LeafType;
use vbridge_trace::{ComparisonFunction, ConversionFunction, ConvertedTrace};

use crate::MarkError;

/// Marks classify leaves of the same type.
pub type MarkType = LeafType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrOperator {
    #[default]
    Eq,
    Ne,
    Re,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One attribute condition of a mark version. The leaf's value is the left
/// operand: `lt` holds when the leaf value is less than `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPattern {
    pub attr: String,
    pub value: String,
    #[serde(default)]
    pub op: AttrOperator,
    #[serde(default)]
    pub is_compare: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeVerdict {
    #[default]
    #[serde(alias = "0")]
    Unknown,
    #[serde(alias = "1")]
    Bug,
    #[serde(alias = "2")]
    TargetBug,
    #[serde(alias = "3")]
    FalsePositive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeVerdict {
    #[default]
    #[serde(alias = "0")]
    Unknown,
    #[serde(alias = "1")]
    IncorrectProof,
    #[serde(alias = "2")]
    MissedTargetBug,
}

impl UnsafeVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            UnsafeVerdict::Unknown => "unknown",
            UnsafeVerdict::Bug => "bug",
            UnsafeVerdict::TargetBug => "target_bug",
            UnsafeVerdict::FalsePositive => "false_positive",
        }
    }
}

impl SafeVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            SafeVerdict::Unknown => "unknown",
            SafeVerdict::IncorrectProof => "incorrect_proof",
            SafeVerdict::MissedTargetBug => "missed_target_bug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarkPayload {
    Safe {
        verdict: SafeVerdict,
        #[serde(default)]
        tags: Vec<String>,
    },
    Unsafe {
        verdict: UnsafeVerdict,
        #[serde(default)]
        tags: Vec<String>,
        conversion: ConversionFunction,
        comparison: ComparisonFunction,
        threshold: f64,
        error_trace: ConvertedTrace,
    },
    Unknown {
        function: String,
        problem: String,
        #[serde(default)]
        is_regexp: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
}

impl MarkPayload {
    pub fn mark_type(&self) -> MarkType {
        match self {
            MarkPayload::Safe { .. } => LeafType::Safe,
            MarkPayload::Unsafe { .. } => LeafType::Unsafe,
            MarkPayload::Unknown { .. } => LeafType::Unknown,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            MarkPayload::Safe { tags, .. } | MarkPayload::Unsafe { tags, .. } => tags,
            MarkPayload::Unknown { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkVersion {
    pub version: u32,
    pub attrs: Vec<AttrPattern>,
    pub edited_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payload: MarkPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub identifier: String,
    pub mark_type: MarkType,
    #[serde(default = "default_true")]
    pub is_modifiable: bool,
    /// Full history, oldest first. Never empty.
    pub versions: Vec<MarkVersion>,
}

fn default_true() -> bool {
    true
}

impl Mark {
    pub fn new(identifier: impl Into<String>, version: MarkVersion) -> Self {
        Self {
            identifier: identifier.into(),
            mark_type: version.payload.mark_type(),
            is_modifiable: true,
            versions: vec![version],
        }
    }

    pub fn current(&self) -> Option<&MarkVersion> {
        self.versions.last()
    }

    pub fn version_number(&self) -> u32 {
        self.current().map(|v| v.version).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), MarkError> {
        if self.identifier.trim().is_empty() {
            return Err(MarkError::Invalid("mark identifier is empty".to_string()));
        }
        if self.versions.is_empty() {
            return Err(MarkError::Invalid(format!(
                "mark '{}' has no versions",
                self.identifier
            )));
        }
        for v in &self.versions {
            if v.payload.mark_type() != self.mark_type {
                return Err(MarkError::Invalid(format!(
                    "version {} of mark '{}' is not a {} mark",
                    v.version,
                    self.identifier,
                    self.mark_type.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// All known marks by identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkStore {
    marks: BTreeMap<String, Mark>,
}

impl MarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Mark> {
        self.marks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mark> {
        self.marks.values()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Adds a version to `id`, creating the mark when it is new. The version
    /// number is assigned here.
    pub fn upsert(&mut self, id: &str, mut version: MarkVersion) -> Result<&Mark, MarkError> {
        match self.marks.get_mut(id) {
            Some(mark) => {
                if !mark.is_modifiable {
                    return Err(MarkError::NotModifiable(id.to_string()));
                }
                if version.payload.mark_type() != mark.mark_type {
                    return Err(MarkError::Invalid(format!(
                        "mark '{}' is a {} mark",
                        id,
                        mark.mark_type.as_str()
                    )));
                }
                version.version = mark.version_number() + 1;
                mark.versions.push(version);
            }
            None => {
                version.version = 1;
                self.marks.insert(id.to_string(), Mark::new(id, version));
            }
        }
        self.marks
            .get(id)
            .ok_or_else(|| MarkError::Unknown(id.to_string()))
    }

    /// Stores an imported mark with its history, replacing any mark with the
    /// same identifier.
    pub fn replace(&mut self, mark: Mark) -> Result<(), MarkError> {
        mark.validate()?;
        self.marks.insert(mark.identifier.clone(), mark);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Mark, MarkError> {
        self.marks
            .remove(id)
            .ok_or_else(|| MarkError::Unknown(id.to_string()))
    }
}
