//! Credentialed export of staged artifacts.
//!
//! Export plugins (Dataverse, Zenodo, B2SHARE and friends) are external
//! collaborators; the core only knows the token-upload contract defined
//! here. Plugins are constructed per action from a provider registry, with
//! a setup block merged from the shared credentials table and the action's
//! own overrides.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use serde_yaml::Value;

use crate::config::{self, EXPORT_ACTIONS_SCHEMA};
use crate::error::{ConfigError, ExportError};
use crate::types::{
    ExportAction, ExportElem, ExportItem, ExportItemType, ExportedPid, SecurityContext,
    SecurityContextTable,
};

/// A booked-but-unpublished deposition at the remote service.
#[derive(Clone, Debug)]
pub struct DraftEntry {
    pub draft_id: String,
    pub pid: Option<String>,
    pub metadata: serde_json::Value,
}

/// The contract every export plugin implements. Only `push` is mandatory;
/// services with a draft lifecycle can expose it through the remaining
/// operations.
#[async_trait]
pub trait ExportPlugin: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Upload the resolved elements and return the persistent identifiers
    /// minted for them.
    async fn push(
        &self,
        items: &[ExportElem],
        preferred_scheme: Option<&str>,
        preferred_id: Option<&str>,
    ) -> Result<Vec<ExportedPid>>;

    async fn book_pid(&self, _preferred: Option<&str>) -> Result<DraftEntry> {
        Err(ExportError::DraftUnsupported {
            plugin_id: self.plugin_id().to_string(),
        }
        .into())
    }

    async fn update_metadata(
        &self,
        _draft: &DraftEntry,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        Err(ExportError::DraftUnsupported {
            plugin_id: self.plugin_id().to_string(),
        }
        .into())
    }

    async fn publish(&self, _draft: &DraftEntry) -> Result<ExportedPid> {
        Err(ExportError::DraftUnsupported {
            plugin_id: self.plugin_id().to_string(),
        }
        .into())
    }

    /// Discard a draft (or, where the service allows it, a published pid).
    /// Returns whether anything was removed.
    async fn discard(&self, _draft_or_pid: &str) -> Result<bool> {
        Err(ExportError::DraftUnsupported {
            plugin_id: self.plugin_id().to_string(),
        }
        .into())
    }
}

/// Builds a plugin instance for one action, from its merged setup block.
pub trait ExportPluginProvider: Send + Sync {
    fn plugin_id(&self) -> &str;
    fn instantiate(&self, setup: Option<&SecurityContext>) -> Result<Arc<dyn ExportPlugin>>;
}

/// Registry of export plugin providers, keyed by plugin id.
#[derive(Default)]
pub struct ExportPluginRegistry {
    providers: HashMap<String, Arc<dyn ExportPluginProvider>>,
}

impl ExportPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ExportPluginProvider>) {
        self.providers
            .insert(provider.plugin_id().to_string(), provider);
    }

    pub fn instantiate(
        &self,
        plugin_id: &str,
        setup: Option<&SecurityContext>,
    ) -> Result<Arc<dyn ExportPlugin>> {
        let provider = self.providers.get(plugin_id).ok_or_else(|| {
            ExportError::UnknownPlugin {
                plugin_id: plugin_id.to_string(),
            }
        })?;
        provider.instantiate(setup)
    }
}

/// Parse one `what` selector: `param:name`, `input:name`, `output:name`,
/// or `working-directory:`.
pub fn parse_export_item(selector: &str) -> Result<ExportItem> {
    let malformed = || ConfigError::MalformedExportItem {
        selector: selector.to_string(),
    };

    let colon = selector.find(':').ok_or_else(malformed)?;
    if colon == 0 {
        return Err(malformed().into());
    }
    let (raw_type, name) = selector.split_at(colon);
    let name = &name[1..];

    let item_type = ExportItemType::from_str(raw_type).map_err(|_| malformed())?;
    let name = if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    };

    match (item_type, &name) {
        (ExportItemType::WorkingDirectory, Some(_)) => Err(malformed().into()),
        _ => Ok(ExportItem { item_type, name }),
    }
}

/// Parse a sequence of raw export-action mappings.
pub fn parse_export_actions(raw_actions: &Value) -> Result<Vec<ExportAction>> {
    // The schema expects the same wrapped shape standalone action files
    // carry.
    let mut wrapper = serde_yaml::Mapping::new();
    wrapper.insert(Value::from("exports"), raw_actions.clone());
    let doc = config::yaml_to_json(&Value::Mapping(wrapper))?;
    config::validate_against(EXPORT_ACTIONS_SCHEMA, &doc).context("export actions block")?;

    let Value::Sequence(items) = raw_actions else {
        return Ok(Vec::new());
    };

    let mut actions = Vec::new();
    for item in items {
        let Value::Mapping(desc) = item else {
            continue;
        };
        let get_str = |field: &str| {
            desc.get(&Value::from(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let (Some(action_id), Some(plugin_id)) = (get_str("id"), get_str("plugin")) else {
            // Unreachable after schema validation, but never panic on it.
            continue;
        };

        let mut what = Vec::new();
        if let Some(Value::Sequence(selectors)) = desc.get(&Value::from("what")) {
            for selector in selectors {
                if let Some(selector) = selector.as_str() {
                    what.push(parse_export_item(selector)?);
                }
            }
        }

        let setup = desc
            .get(&Value::from("setup"))
            .cloned()
            .and_then(|value| serde_yaml::from_value::<SecurityContext>(value).ok());

        actions.push(ExportAction {
            action_id,
            plugin_id,
            what,
            context_name: get_str("security-context"),
            setup,
            preferred_scheme: get_str("preferred-scheme"),
            preferred_id: get_str("preferred-pid"),
        });
    }
    Ok(actions)
}

/// Resolve the setup block of one action: the shared context named by the
/// action, with the action-level setup overriding shared entries
/// key-by-key.
pub fn merge_action_setup(
    action: &ExportAction,
    credentials: &SecurityContextTable,
) -> Result<Option<SecurityContext>> {
    let shared = match &action.context_name {
        Some(context) => Some(credentials.get(context).cloned().ok_or_else(|| {
            ExportError::MissingCredentials {
                context: context.clone(),
                action_id: action.action_id.clone(),
            }
        })?),
        None => None,
    };

    Ok(match (shared, &action.setup) {
        (Some(mut merged), Some(overrides)) => {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Some(merged)
        }
        (Some(shared), None) => Some(shared),
        (None, Some(overrides)) => Some(overrides.clone()),
        (None, None) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn selector_grammar() {
        let item = parse_export_item("output:results").unwrap();
        pretty_assert_eq!(item.item_type, ExportItemType::Output);
        pretty_assert_eq!(item.name.as_deref(), Some("results"));

        let item = parse_export_item("input:genome").unwrap();
        pretty_assert_eq!(item.item_type, ExportItemType::Param);

        let item = parse_export_item("working-directory:").unwrap();
        pretty_assert_eq!(item.item_type, ExportItemType::WorkingDirectory);
        pretty_assert_eq!(item.name, None);

        assert!(parse_export_item("bogus").is_err());
        assert!(parse_export_item("unknown:thing").is_err());
        assert!(parse_export_item("working-directory:name").is_err());
    }

    #[test]
    fn actions_parse_with_contexts() {
        let raw: Value = serde_yaml::from_str(
            r#"
- id: a1
  plugin: dataverse
  what: ["output:results", "working-directory:"]
  security-context: dv1
  preferred-scheme: doi
"#,
        )
        .unwrap();
        let actions = parse_export_actions(&raw).unwrap();
        pretty_assert_eq!(actions.len(), 1);
        pretty_assert_eq!(actions[0].action_id, "a1");
        pretty_assert_eq!(actions[0].what.len(), 2);
        pretty_assert_eq!(actions[0].context_name.as_deref(), Some("dv1"));
        pretty_assert_eq!(actions[0].preferred_scheme.as_deref(), Some("doi"));
    }

    #[test]
    fn setup_overrides_shared_context() {
        let mut credentials = SecurityContextTable::new();
        let mut shared = SecurityContext::new();
        shared.insert("token".into(), Value::from("shared-token"));
        shared.insert("endpoint".into(), Value::from("https://dv.example"));
        credentials.insert("dv1".into(), shared);

        let mut setup = SecurityContext::new();
        setup.insert("token".into(), Value::from("action-token"));

        let action = ExportAction {
            action_id: "a1".into(),
            plugin_id: "dataverse".into(),
            what: vec![],
            context_name: Some("dv1".into()),
            setup: Some(setup),
            preferred_scheme: None,
            preferred_id: None,
        };

        let merged = merge_action_setup(&action, &credentials).unwrap().unwrap();
        pretty_assert_eq!(merged["token"], Value::from("action-token"));
        pretty_assert_eq!(merged["endpoint"], Value::from("https://dv.example"));
    }

    #[test]
    fn missing_context_is_typed() {
        let action = ExportAction {
            action_id: "a1".into(),
            plugin_id: "dataverse".into(),
            what: vec![],
            context_name: Some("nope".into()),
            setup: None,
            preferred_scheme: None,
            preferred_id: None,
        };
        let err = merge_action_setup(&action, &SecurityContextTable::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExportError>(),
            Some(ExportError::MissingCredentials { .. })
        ));
    }
}
