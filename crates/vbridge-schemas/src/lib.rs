use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub fn schema_names() -> Vec<String> {
    SCHEMAS
        .files()
        .filter_map(|f| f.path().file_name().and_then(|n| n.to_str()))
        .map(|s| s.to_string())
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS
        .get_file(name)
        .ok_or_else(|| anyhow!("unknown schema: {}", name))?;
    let text = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema {} is not valid utf-8", name))?;
    Ok(serde_json::from_str(text)?)
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    JSONSchema::compile(&schema).map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

/// Validates `value` and folds every violation into one message.
pub fn validate_value(schema: &JSONSchema, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        return Err(anyhow!("{}", msgs.join("; ")));
    }
    Ok(())
}
