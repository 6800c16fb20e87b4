use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tracing::info;
use vbridge_core::sha256_bytes;
use vbridge_schemas::{compile_schema, validate_value};
use vbridge_trace::{
    convert, validate_threshold, ComparisonFunction, ConversionFunction, ConvertedTrace, ErrorTrace,
};

use crate::filter::ProblemMatcher;
use crate::mark::{AttrPattern, Mark, MarkPayload, MarkType, MarkVersion, SafeVerdict, UnsafeVerdict};
use crate::MarkError;

const MARKDATA: &str = "markdata";
const VERSION_PREFIX: &str = "version-";

/// Body of one mark version as it is uploaded or exported.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarkDocument {
    #[serde(default)]
    pub version: Option<u32>,
    pub attrs: Vec<AttrPattern>,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub conversion_function: Option<ConversionFunction>,
    #[serde(default)]
    pub comparison_function: Option<ComparisonFunction>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub error_trace: Option<ConvertedTrace>,
    #[serde(default)]
    pub raw_error_trace: Option<Value>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub is_regexp: bool,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl MarkDocument {
    pub fn from_value(value: &Value) -> Result<Self, MarkError> {
        let schema = compile_schema("mark_version_v1.jsonschema")
            .map_err(|e| MarkError::Invalid(e.to_string()))?;
        validate_value(&schema, value).map_err(|e| MarkError::Invalid(e.to_string()))?;
        Self::deserialize(value).map_err(|e| MarkError::Invalid(e.to_string()))
    }

    /// Builds a version of a `mark_type` mark. When only a raw trace is
    /// given it is converted with the mark's conversion function.
    pub fn into_version(self, mark_type: MarkType, now: DateTime<Utc>) -> Result<MarkVersion, MarkError> {
        let payload = match mark_type {
            MarkType::Safe => MarkPayload::Safe {
                verdict: parse_verdict::<SafeVerdict>(self.verdict.as_deref())?,
                tags: self.tags,
            },
            MarkType::Unsafe => {
                let conversion = self.conversion_function.unwrap_or_default();
                let comparison = self.comparison_function.unwrap_or_default();
                let threshold = validate_threshold(self.similarity.unwrap_or(1.0))
                    .map_err(|e| MarkError::Invalid(e.to_string()))?;
                let error_trace = match (self.error_trace, &self.raw_error_trace) {
                    (Some(trace), _) => trace,
                    (None, Some(raw)) => {
                        let trace = ErrorTrace::from_value(raw)
                            .map_err(|e| MarkError::Invalid(e.to_string()))?;
                        convert(&trace, conversion)
                    }
                    (None, None) if comparison == ComparisonFunction::Skip => ConvertedTrace::default(),
                    (None, None) => {
                        return Err(MarkError::Invalid(
                            "unsafe mark needs error_trace or raw_error_trace".to_string(),
                        ))
                    }
                };
                MarkPayload::Unsafe {
                    verdict: parse_verdict::<UnsafeVerdict>(self.verdict.as_deref())?,
                    tags: self.tags,
                    conversion,
                    comparison,
                    threshold,
                    error_trace,
                }
            }
            MarkType::Unknown => {
                let function = self
                    .function
                    .ok_or_else(|| MarkError::Invalid("unknown mark needs a function".to_string()))?;
                let problem = self
                    .problem
                    .ok_or_else(|| MarkError::Invalid("unknown mark needs a problem".to_string()))?;
                ProblemMatcher::compile(&function, &problem, self.is_regexp)?;
                MarkPayload::Unknown {
                    function,
                    problem,
                    is_regexp: self.is_regexp,
                    link: self.link,
                }
            }
        };
        crate::filter::AttrFilter::compile(&self.attrs)?;
        Ok(MarkVersion {
            version: self.version.unwrap_or(1),
            attrs: self.attrs,
            edited_at: self.edited_at.unwrap_or(now),
            status: self.status,
            comment: self.comment,
            description: self.description,
            payload,
        })
    }
}

fn parse_verdict<T: Default + serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<T, MarkError> {
    match raw {
        None => Ok(T::default()),
        Some(v) => serde_json::from_value(Value::String(v.to_string()))
            .map_err(|_| MarkError::Invalid(format!("unknown verdict '{}'", v))),
    }
}

#[derive(Debug, Deserialize)]
struct MarkData {
    #[serde(default)]
    identifier: Option<String>,
    mark_type: MarkType,
    #[serde(default = "default_true")]
    is_modifiable: bool,
    #[serde(default)]
    format: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Reads an exported mark: a ZIP with a `markdata` manifest and one
/// `version-N` document per version.
pub fn read_mark_archive(bytes: &[u8], now: DateTime<Utc>) -> Result<Mark, MarkError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| MarkError::Archive(e.to_string()))?;
    let mut markdata: Option<MarkData> = None;
    let mut versions: BTreeMap<u32, Value> = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| MarkError::Archive(e.to_string()))?;
        let name = file.name().rsplit('/').next().unwrap_or("").to_string();
        if name != MARKDATA && !name.starts_with(VERSION_PREFIX) {
            continue;
        }
        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| MarkError::Archive(format!("{}: {}", name, e)))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| MarkError::Archive(format!("{}: {}", name, e)))?;
        if name == MARKDATA {
            markdata = Some(
                MarkData::deserialize(&value).map_err(|e| MarkError::Archive(format!("markdata: {}", e)))?,
            );
        } else {
            let n: u32 = name[VERSION_PREFIX.len()..]
                .parse()
                .map_err(|_| MarkError::Archive(format!("bad version entry '{}'", name)))?;
            versions.insert(n, value);
        }
    }
    let markdata = markdata.ok_or_else(|| MarkError::Archive("markdata is missing".to_string()))?;
    if let Some(format) = markdata.format {
        if format != 1 {
            return Err(MarkError::Archive(format!("unsupported mark format {}", format)));
        }
    }
    if versions.is_empty() {
        return Err(MarkError::Archive("archive has no mark versions".to_string()));
    }
    let mut out = Vec::with_capacity(versions.len());
    for (n, value) in versions {
        let mut version = MarkDocument::from_value(&value)?.into_version(markdata.mark_type, now)?;
        version.version = n;
        out.push(version);
    }
    let identifier = markdata
        .identifier
        .unwrap_or_else(|| sha256_bytes(bytes).trim_start_matches("sha256:")[..32].to_string());
    let mark = Mark {
        identifier,
        mark_type: markdata.mark_type,
        is_modifiable: markdata.is_modifiable,
        versions: out,
    };
    mark.validate()?;
    info!(mark = %mark.identifier, versions = mark.versions.len(), "mark archive read");
    Ok(mark)
}

/// Reads a preset mark: one JSON document carrying identifier, type and a
/// single version body.
pub fn read_mark_preset(value: &Value, now: DateTime<Utc>) -> Result<Mark, MarkError> {
    let schema = compile_schema("mark_preset_v1.jsonschema")
        .map_err(|e| MarkError::Invalid(e.to_string()))?;
    validate_value(&schema, value).map_err(|e| MarkError::Invalid(e.to_string()))?;
    let head = MarkData::deserialize(value).map_err(|e| MarkError::Invalid(e.to_string()))?;
    let identifier = head
        .identifier
        .ok_or_else(|| MarkError::Invalid("preset has no identifier".to_string()))?;
    let version = MarkDocument::from_value(value)?.into_version(head.mark_type, now)?;
    let mark = Mark {
        identifier,
        mark_type: head.mark_type,
        is_modifiable: head.is_modifiable,
        versions: vec![MarkVersion { version: 1, ..version }],
    };
    mark.validate()?;
    Ok(mark)
}

/// Accepts either form: ZIP bytes or a preset JSON document.
pub fn read_mark_bytes(bytes: &[u8], now: DateTime<Utc>) -> Result<Mark, MarkError> {
    if bytes.starts_with(b"PK\x03\x04") {
        return read_mark_archive(bytes, now);
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| MarkError::Invalid(e.to_string()))?;
    read_mark_preset(&value, now)
}
