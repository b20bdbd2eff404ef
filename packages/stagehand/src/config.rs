//! Staging configuration: loading, schema validation, credentials.
//!
//! The staging definition (`workflow_meta.yaml`) must validate against the
//! published JSON Schema before any staging begins; validation failures
//! report every violation, not just the first. Credential tables are loaded
//! separately and live in memory only.

use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::instrument;

use crate::error::ConfigError;
use crate::types::{ContainerKind, SecurityContextTable};

/// JSON Schema the staging definition validates against.
pub const STAGE_DEFINITION_SCHEMA: &str = include_str!("../schemas/stage-definition.json");
/// JSON Schema for credential tables.
pub const SECURITY_CONTEXT_SCHEMA: &str = include_str!("../schemas/security-context.json");
/// JSON Schema for standalone export-actions files.
pub const EXPORT_ACTIONS_SCHEMA: &str = include_str!("../schemas/export-actions.json");

/// Enactment tweaks carried in the staging definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowConfigBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable_containers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerKind>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl WorkflowConfigBlock {
    /// Working directories are encrypted unless explicitly opted out.
    pub fn secure(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    pub fn writable_containers(&self) -> bool {
        self.writable_containers.unwrap_or(false)
    }
}

/// The staging definition: which workflow to enact, with which inputs,
/// placeholders, outputs and default export actions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowMetaConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub workflow_id: String,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trs_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub paranoid_mode: bool,
    #[serde(default)]
    pub workflow_config: WorkflowConfigBlock,
    #[serde(default = "empty_mapping")]
    pub params: serde_yaml::Value,
    #[serde(default = "empty_mapping")]
    pub placeholders: serde_yaml::Value,
    #[serde(default = "empty_mapping")]
    pub outputs: serde_yaml::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_actions: Option<serde_yaml::Value>,
}

fn empty_mapping() -> serde_yaml::Value {
    serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
}

impl WorkflowMetaConfig {
    /// The placeholder substitution table, with scalar values stringified.
    pub fn placeholder_table(&self) -> BTreeMap<String, String> {
        placeholder_table(&self.placeholders)
    }
}

/// Parse and validate a staging definition from YAML text.
pub fn parse_staging_config(yaml: &str) -> Result<WorkflowMetaConfig> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("parse staging definition YAML")?;
    let doc = yaml_to_json(&value)?;
    validate_against(STAGE_DEFINITION_SCHEMA, &doc)?;
    serde_yaml::from_value(value).context("decode staging definition")
}

/// Load and validate a staging definition file.
#[instrument]
pub async fn load_staging_config(path: &Path) -> Result<WorkflowMetaConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read staging definition {path:?}"))?;
    parse_staging_config(&raw).with_context(|| format!("invalid staging definition {path:?}"))
}

/// Load and validate a credentials file. The result never leaves memory.
#[instrument]
pub async fn load_security_contexts(path: &Path) -> Result<SecurityContextTable> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read security contexts {path:?}"))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&raw).context("parse security contexts YAML")?;
    let doc = yaml_to_json(&value)?;
    validate_against(SECURITY_CONTEXT_SCHEMA, &doc)?;
    serde_yaml::from_value(value).context("decode security contexts")
}

/// Validate a document against one of the published schemas, reporting
/// every violation.
pub fn validate_against(schema_src: &str, doc: &serde_json::Value) -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(schema_src).context("parse embedded schema")?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| eyre!("compile embedded schema: {err}"))?;

    let violations: Vec<String> = validator
        .iter_errors(doc)
        .map(|err| format!("{}: {err}", err.instance_path))
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaValidation { violations }.into())
    }
}

/// Convert a YAML value into its JSON counterpart for schema validation.
/// Non-string mapping keys are stringified; tagged values are rejected.
pub fn yaml_to_json(value: &serde_yaml::Value) -> Result<serde_json::Value> {
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => serde_json::Value::Null,
        Yaml::Bool(b) => serde_json::Value::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                serde_json::Value::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Yaml::String(s) => serde_json::Value::String(s.clone()),
        Yaml::Sequence(seq) => serde_json::Value::Array(
            seq.iter().map(yaml_to_json).collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let key = match key {
                    Yaml::String(s) => s.clone(),
                    Yaml::Number(n) => n.to_string(),
                    Yaml::Bool(b) => b.to_string(),
                    other => return Err(eyre!("unsupported mapping key {other:?}")),
                };
                out.insert(key, yaml_to_json(val)?);
            }
            serde_json::Value::Object(out)
        }
        Yaml::Tagged(tagged) => {
            return Err(eyre!("unsupported YAML tag {:?}", tagged.tag));
        }
    })
}

/// Build a placeholder substitution table from a YAML mapping, with scalar
/// values stringified.
pub fn placeholder_table(placeholders: &serde_yaml::Value) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    if let serde_yaml::Value::Mapping(map) = placeholders {
        for (key, value) in map {
            let Some(name) = key.as_str() else { continue };
            let rendered = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                _ => continue,
            };
            table.insert(name.to_string(), rendered);
        }
    }
    table
}

/// Deserialize a string from either a YAML string or a number; WorkflowHub
/// uses integer workflow and version ids.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

/// Optional variant of [`string_or_number`].
pub fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    }))
}
