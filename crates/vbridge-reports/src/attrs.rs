use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use vbridge_core::{BlobHandle, IngestionError};

/// Index of an interned `(name, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrId(pub u32);

/// Attribute as it arrives on the wire. `value` is a scalar or a nested group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAttr {
    pub name: String,
    pub value: RawAttrValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAttrValue {
    Group(Vec<RawAttr>),
    Scalar(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAttr {
    pub name: String,
    pub value: String,
    pub compare: bool,
    pub associate: bool,
    /// Attachment name of the attribute's data file, not yet stored.
    pub data: Option<String>,
}

/// Flattens nested groups into `group:name` entries, keeping wire order.
/// Flags set on a group are inherited by its members unless overridden.
pub fn normalize_attrs(raw: &[RawAttr]) -> Result<Vec<NormalizedAttr>, IngestionError> {
    let mut out = Vec::new();
    flatten_into(raw, None, None, None, &mut out)?;
    let mut seen = BTreeSet::new();
    for attr in &out {
        if !seen.insert(attr.name.as_str()) {
            return Err(IngestionError::Malformed(format!(
                "attribute '{}' is listed twice",
                attr.name
            )));
        }
    }
    Ok(out)
}

fn flatten_into(
    raw: &[RawAttr],
    prefix: Option<&str>,
    compare: Option<bool>,
    associate: Option<bool>,
    out: &mut Vec<NormalizedAttr>,
) -> Result<(), IngestionError> {
    for attr in raw {
        let name = attr.name.trim();
        if name.is_empty() {
            return Err(IngestionError::Malformed("attribute name is empty".to_string()));
        }
        let name = match prefix {
            Some(p) => format!("{}:{}", p, name),
            None => name.to_string(),
        };
        let compare = attr.compare.or(compare);
        let associate = attr.associate.or(associate);
        match &attr.value {
            RawAttrValue::Group(children) => {
                flatten_into(children, Some(&name), compare, associate, out)?;
            }
            RawAttrValue::Scalar(value) => {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(IngestionError::Malformed(format!(
                            "attribute '{}' has unsupported value {}",
                            name, other
                        )))
                    }
                };
                out.push(NormalizedAttr {
                    name,
                    value,
                    compare: compare.unwrap_or(false),
                    associate: associate.unwrap_or(true),
                    data: attr.data.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Attribute reference held by a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAttr {
    pub attr: AttrId,
    pub compare: bool,
    pub associate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BlobHandle>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AttrTable {
    names: Vec<String>,
    entries: Vec<(u32, String)>,
}

/// Global intern table. Names are deduplicated on their own, pairs are
/// keyed by `(name, value)`; ids are never reused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "AttrTable", into = "AttrTable")]
pub struct AttrStore {
    names: Vec<String>,
    name_index: HashMap<String, u32>,
    entries: Vec<(u32, String)>,
    entry_index: HashMap<(u32, String), AttrId>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str, value: &str) -> AttrId {
        let name_id = match self.name_index.get(name) {
            Some(id) => *id,
            None => {
                let id = self.names.len() as u32;
                self.names.push(name.to_string());
                self.name_index.insert(name.to_string(), id);
                id
            }
        };
        let key = (name_id, value.to_string());
        if let Some(id) = self.entry_index.get(&key) {
            return *id;
        }
        let id = AttrId(self.entries.len() as u32);
        self.entries.push(key.clone());
        self.entry_index.insert(key, id);
        id
    }

    pub fn get(&self, id: AttrId) -> Option<(&str, &str)> {
        let (name_id, value) = self.entries.get(id.0 as usize)?;
        let name = self.names.get(*name_id as usize)?;
        Some((name.as_str(), value.as_str()))
    }

    pub fn name(&self, id: AttrId) -> Option<&str> {
        self.get(id).map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// `(name, value)` pairs of the given attributes, in order. Unknown ids
    /// are skipped.
    pub fn resolve<'a>(
        &'a self,
        attrs: impl IntoIterator<Item = &'a ReportAttr>,
    ) -> Vec<(&'a str, &'a str)> {
        attrs.into_iter().filter_map(|a| self.get(a.attr)).collect()
    }
}

impl From<AttrTable> for AttrStore {
    fn from(table: AttrTable) -> Self {
        let name_index = table
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        let entry_index = table
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), AttrId(i as u32)))
            .collect();
        Self {
            names: table.names,
            name_index,
            entries: table.entries,
            entry_index,
        }
    }
}

impl From<AttrStore> for AttrTable {
    fn from(store: AttrStore) -> Self {
        Self {
            names: store.names,
            entries: store.entries,
        }
    }
}
