use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".vbridge";
pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub version: String,
    pub storage: StorageConfig,
    pub marks: MarksConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    pub blob_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarksConfig {
    /// Mark archives and presets picked up by `import-marks` by default.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub validate_events: bool,
    /// Users allowed to upload reports. Empty allows everyone.
    #[serde(default)]
    pub service_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub filter: String,
}

impl BridgeConfig {
    /// In-memory defaults rooted at `root`, used when no config file exists.
    pub fn rooted_at(root: &Path) -> Self {
        let dir = root.join(CONFIG_DIR);
        Self {
            version: "1".to_string(),
            storage: StorageConfig {
                state_dir: dir.join("state"),
                blob_dir: dir.join("blobs"),
            },
            marks: MarksConfig {
                dir: dir.join("marks"),
            },
            ingest: IngestConfig::default(),
            log: LogConfig {
                filter: "info".to_string(),
            },
        }
    }

    fn resolve_paths(&mut self, root: &Path) {
        for path in [
            &mut self.storage.state_dir,
            &mut self.storage.blob_dir,
            &mut self.marks.dir,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }
}

/// Walks up from `start` to the directory that holds `.vbridge/`.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut cur = Some(start);
    while let Some(p) = cur {
        if p.join(CONFIG_DIR).is_dir() {
            return p.to_path_buf();
        }
        cur = p.parent();
    }
    start.to_path_buf()
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Loads the config under `root`, falling back to defaults when the file
/// does not exist. Relative paths are taken from `root`.
pub fn load_config(root: &Path) -> Result<BridgeConfig> {
    let path = config_path(root);
    if !path.exists() {
        return Ok(BridgeConfig::rooted_at(root));
    }
    let raw_yaml = fs::read_to_string(&path)?;
    let mut config = parse_config(&raw_yaml)?;
    config.resolve_paths(root);
    Ok(config)
}

pub fn parse_config(raw_yaml: &str) -> Result<BridgeConfig> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&json_value)?;
    Ok(serde_json::from_value(json_value)?)
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/version",
        "/storage/state_dir",
        "/storage/blob_dir",
        "/marks/dir",
        "/log/filter",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "config.yaml missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

pub fn config_template() -> &'static str {
    "\
version: '1'
storage:
  state_dir: ''                       # REQUIRED: e.g. .vbridge/state
  blob_dir: ''                        # REQUIRED: e.g. .vbridge/blobs
marks:
  dir: ''                             # REQUIRED: e.g. .vbridge/marks
ingest:
  validate_events: true
  service_users: []                   # empty: any user may upload reports
log:
  filter: info
"
}
