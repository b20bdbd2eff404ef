//! Research-Object-Crate emission.
//!
//! Two crates can be emitted per instance: the stage crate (workflow,
//! formal parameters, expected outputs, container software entries) and the
//! execution crate (everything in the stage crate plus a `CreateAction`
//! bracketing the run, with inputs as object and outputs as result).
//!
//! RO-Crate graphs are naturally cyclic (workflow → formal parameter →
//! workExample → workflow), so the builder keeps an arena of nodes keyed by
//! `@id` and emits each node exactly once, with cross-references expressed
//! as id strings.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use jiff::Timestamp;
use serde_json::{Value, json};
use tokio::task::spawn_blocking;
use tracing::{info, instrument};

use crate::digest;
use crate::engine::{self, MaterializedEngine};
use crate::instance::WorkflowInstance;
use crate::types::{
    ContentKind, ExitVal, ExpectedOutput, InputValue, LocalWorkflow, MaterializedInput,
    MaterializedOutput, OutputValue, ScalarValue, StageMark,
};
use crate::workdir::WorkdirLayout;

pub const STAGE_CRATE_NAME: &str = "staged.crate.zip";
pub const EXECUTION_CRATE_NAME: &str = "execution.crate.zip";

const RO_CRATE_CONTEXT: &str = "https://w3id.org/ro/crate/1.1/context";
const FORMAL_PARAMETER_PROFILE: &str =
    "https://bioschemas.org/profiles/FormalParameter/1.0-RELEASE/";

/// Arena-of-nodes crate builder keyed by `@id`.
pub struct CrateBuilder {
    graph: Vec<serde_json::Map<String, Value>>,
    index: HashMap<String, usize>,
}

impl CrateBuilder {
    /// An empty crate with its metadata descriptor and root dataset.
    pub fn new() -> Self {
        let mut builder = Self {
            graph: Vec::new(),
            index: HashMap::new(),
        };
        builder.set(
            "ro-crate-metadata.json",
            "@type",
            Value::String("CreativeWork".into()),
        );
        builder.set(
            "ro-crate-metadata.json",
            "conformsTo",
            json!({"@id": "https://w3id.org/ro/crate/1.1"}),
        );
        builder.set("ro-crate-metadata.json", "about", json!({"@id": "./"}));
        builder.set("./", "@type", Value::String("Dataset".into()));
        builder
    }

    fn node_index(&mut self, id: &str) -> usize {
        if let Some(&index) = self.index.get(id) {
            return index;
        }
        let mut node = serde_json::Map::new();
        node.insert("@id".into(), Value::String(id.to_string()));
        self.graph.push(node);
        let index = self.graph.len() - 1;
        self.index.insert(id.to_string(), index);
        index
    }

    /// Set (or overwrite) one property on the node with the given id,
    /// creating the node on first touch.
    pub fn set(&mut self, id: &str, key: &str, value: Value) {
        let index = self.node_index(id);
        self.graph[index].insert(key.to_string(), value);
    }

    /// Append an `{"@id": target}` reference to an array-valued property,
    /// once per target.
    pub fn push_ref(&mut self, id: &str, key: &str, target: &str) {
        let index = self.node_index(id);
        let entry = self.graph[index]
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let reference = json!({"@id": target});
        if let Value::Array(items) = entry {
            if !items.contains(&reference) {
                items.push(reference);
            }
        }
    }

    /// Serialize into the final JSON-LD document.
    pub fn finish(self) -> Value {
        json!({
            "@context": RO_CRATE_CONTEXT,
            "@graph": self.graph.into_iter().map(Value::Object).collect::<Vec<_>>(),
        })
    }
}

impl Default for CrateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only view over the instance state the emitter needs.
pub struct CrateView<'a> {
    pub instance_id: &'a str,
    pub nickname: &'a str,
    pub layout: &'a WorkdirLayout,
    pub local_workflow: Option<&'a LocalWorkflow>,
    pub materialized_engine: Option<&'a MaterializedEngine>,
    pub workflow_engine_version: Option<&'a str>,
    pub container_engine_version: Option<&'a str>,
    pub materialized_params: &'a [MaterializedInput],
    pub expected_outputs: &'a [ExpectedOutput],
    pub matched_outputs: &'a [MaterializedOutput],
    pub exit_val: Option<ExitVal>,
    pub execution_started: Option<Timestamp>,
    pub execution_ended: Option<Timestamp>,
    pub stage_mark: Option<StageMark>,
    pub execution_mark: Option<StageMark>,
}

/// Write the stage crate for an instance.
#[instrument(skip(instance))]
pub async fn write_stage_crate(
    instance: &WorkflowInstance,
    filename: Option<PathBuf>,
) -> Result<PathBuf> {
    let view = instance.crate_view()?;
    let target = filename.unwrap_or_else(|| view.layout.outputs_dir.join(STAGE_CRATE_NAME));

    let mut builder = CrateBuilder::new();
    let workflow_id = add_stage_graph(&mut builder, &view)?;
    let document = builder.finish();

    let workflow_path = view
        .local_workflow
        .map(LocalWorkflow::entrypoint)
        .filter(|path| path.is_file());
    write_crate_zip(&target, document, workflow_id, workflow_path).await?;
    info!(?target, "staged RO-Crate created");
    Ok(target)
}

/// Write the execution crate for an instance: the stage graph plus the
/// `CreateAction` describing the run.
#[instrument(skip(instance))]
pub async fn write_execution_crate(
    instance: &WorkflowInstance,
    filename: Option<PathBuf>,
) -> Result<PathBuf> {
    let view = instance.crate_view()?;
    let target = filename.unwrap_or_else(|| view.layout.outputs_dir.join(EXECUTION_CRATE_NAME));

    let mut builder = CrateBuilder::new();
    let workflow_id = add_stage_graph(&mut builder, &view)?;
    add_execution_action(&mut builder, &view, &workflow_id)?;
    let document = builder.finish();

    let workflow_path = view
        .local_workflow
        .map(LocalWorkflow::entrypoint)
        .filter(|path| path.is_file());
    write_crate_zip(&target, document, workflow_id, workflow_path).await?;
    info!(?target, "execution RO-Crate created");
    Ok(target)
}

/// Populate the shared stage graph. Returns the workflow node id.
fn add_stage_graph(builder: &mut CrateBuilder, view: &CrateView<'_>) -> Result<String> {
    let workflow = view
        .local_workflow
        .ok_or_else(|| eyre!("no local workflow to describe"))?;

    let workflow_name = workflow
        .rel_path
        .clone()
        .unwrap_or_else(|| {
            workflow
                .dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workflow".to_string())
        });
    let workflow_id = workflow_name.clone();

    builder.set("./", "name", Value::String(view.nickname.to_string()));
    builder.set("./", "identifier", Value::String(view.instance_id.to_string()));
    builder.set("./", "mainEntity", json!({"@id": workflow_id}));
    builder.push_ref("./", "hasPart", &workflow_id);

    builder.set(
        &workflow_id,
        "@type",
        json!(["File", "SoftwareSourceCode", "ComputationalWorkflow"]),
    );
    builder.set(&workflow_id, "name", Value::String(workflow_name));
    if let Some(checkout) = &workflow.effective_checkout {
        builder.set(&workflow_id, "version", Value::String(checkout.clone()));
    }

    // The language node: canonical id plus the engine version used.
    if let Some(materialized) = view.materialized_engine {
        let descriptor = engine::descriptor_of(materialized.kind);
        let language_id = descriptor.rocrate_programming_language.to_string();
        builder.set(
            &workflow_id,
            "programmingLanguage",
            json!({"@id": language_id}),
        );
        builder.set(&language_id, "@type", Value::String("ComputerLanguage".into()));
        builder.set(
            &language_id,
            "name",
            Value::String(descriptor.display_name.to_string()),
        );
        builder.set(
            &language_id,
            "url",
            json!({"@id": descriptor.canonical_url}),
        );
        if let Some(version) = view.workflow_engine_version {
            builder.set(&language_id, "version", Value::String(version.to_string()));
        }

        // Container software entries, versioned by image fingerprint.
        for container in materialized
            .containers
            .iter()
            .chain(materialized.operational_containers.iter())
            .flatten()
        {
            let container_id = format!("#container-{}", container.tagged_name);
            builder.set(
                &container_id,
                "@type",
                Value::String("SoftwareApplication".into()),
            );
            builder.set(
                &container_id,
                "name",
                Value::String(container.tagged_name.clone()),
            );
            if let Some(fingerprint) = &container.fingerprint {
                builder.set(
                    &container_id,
                    "softwareVersion",
                    Value::String(fingerprint.clone()),
                );
            }
            if let Some(version) = view.container_engine_version {
                builder.set(
                    &container_id,
                    "softwareRequirements",
                    Value::String(version.to_string()),
                );
            }
            builder.push_ref("./", "mentions", &container_id);
        }
    }

    // One formal parameter per materialized input, linked back to the
    // workflow through workExample (which is what closes the cycle).
    for param in view.materialized_params {
        let param_id = format!("#param-{}", param.name);
        builder.set(
            &param_id,
            "@type",
            Value::String("FormalParameter".into()),
        );
        builder.set(&param_id, "name", Value::String(param.name.clone()));
        builder.set(
            &param_id,
            "conformsTo",
            Value::String(FORMAL_PARAMETER_PROFILE.into()),
        );
        builder.set(
            &param_id,
            "additionalType",
            Value::String(param_additional_type(&param.values).into()),
        );
        builder.set(&param_id, "workExample", json!({"@id": workflow_id}));
        builder.push_ref(&workflow_id, "input", &param_id);
    }

    for expected in view.expected_outputs {
        let output_id = format!("#output-{}", expected.name);
        builder.set(
            &output_id,
            "@type",
            Value::String("FormalParameter".into()),
        );
        builder.set(&output_id, "name", Value::String(expected.name.clone()));
        builder.set(
            &output_id,
            "conformsTo",
            Value::String(FORMAL_PARAMETER_PROFILE.into()),
        );
        builder.set(
            &output_id,
            "additionalType",
            Value::String(kind_additional_type(expected.kind).into()),
        );
        builder.set(&output_id, "workExample", json!({"@id": workflow_id}));
        builder.push_ref(&workflow_id, "output", &output_id);
    }

    Ok(workflow_id)
}

/// Add the `CreateAction` bracketing the run, with inputs as object and
/// outputs as result.
fn add_execution_action(
    builder: &mut CrateBuilder,
    view: &CrateView<'_>,
    workflow_id: &str,
) -> Result<()> {
    let action_id = format!("#enactment-{}", view.instance_id);
    builder.set(&action_id, "@type", Value::String("CreateAction".into()));
    builder.set(&action_id, "instrument", json!({"@id": workflow_id}));
    builder.push_ref("./", "mentions", &action_id);

    let start = view
        .execution_started
        .or_else(|| view.stage_mark.and_then(|mark| mark.timestamp()));
    let end = view
        .execution_ended
        .or_else(|| view.execution_mark.and_then(|mark| mark.timestamp()));
    if let Some(start) = start {
        builder.set(&action_id, "startTime", Value::String(start.to_string()));
    }
    if let Some(end) = end {
        builder.set(&action_id, "endTime", Value::String(end.to_string()));
    }
    if let Some(exit_val) = view.exit_val {
        builder.set(&action_id, "exitCode", json!(exit_val.0));
    }

    for param in view.materialized_params {
        builder.push_ref(&action_id, "object", &format!("#param-{}", param.name));
    }

    for output in view.matched_outputs {
        for (index, value) in output.values.iter().enumerate() {
            match value {
                OutputValue::File(content) => {
                    let file_id = output_value_id(&content.local, &view.layout.outputs_dir);
                    builder.set(&file_id, "@type", Value::String("File".into()));
                    if let Some(signature) = &content.signature {
                        builder.set(&file_id, "contentHash", Value::String(signature.clone()));
                    }
                    builder.push_ref(&action_id, "result", &file_id);
                    builder.push_ref("./", "hasPart", &file_id);
                }
                OutputValue::Directory(content) => {
                    // Generated directories are identified by their
                    // synthetic digest, with every contained file attached
                    // through isPartOf.
                    let dir_id = content
                        .signature
                        .clone()
                        .unwrap_or_else(|| format!("#dir-{}-{index}", output.name));
                    builder.set(&dir_id, "@type", Value::String("Dataset".into()));
                    builder.set(
                        &dir_id,
                        "name",
                        Value::String(
                            content
                                .preferred_filename
                                .clone()
                                .unwrap_or_else(|| output.name.clone()),
                        ),
                    );
                    builder.push_ref(&action_id, "result", &dir_id);

                    for entry in &content.values {
                        if let OutputValue::File(file) = entry {
                            let file_id =
                                output_value_id(&file.local, &view.layout.outputs_dir);
                            builder.set(&file_id, "@type", Value::String("File".into()));
                            if let Some(signature) = &file.signature {
                                builder.set(
                                    &file_id,
                                    "contentHash",
                                    Value::String(signature.clone()),
                                );
                            }
                            builder.set(&file_id, "isPartOf", json!({"@id": dir_id}));
                        }
                    }
                }
                OutputValue::Value(text) => {
                    let value_id = format!("#value-{}-{index}", output.name);
                    builder.set(&value_id, "@type", Value::String("PropertyValue".into()));
                    builder.set(&value_id, "name", Value::String(output.name.clone()));
                    builder.set(&value_id, "value", Value::String(text.clone()));
                    builder.push_ref(&action_id, "result", &value_id);
                }
            }
        }
    }

    Ok(())
}

fn output_value_id(local: &Path, outputs_dir: &Path) -> String {
    local
        .strip_prefix(outputs_dir)
        .map(|rel| format!("outputs/{}", rel.display()))
        .unwrap_or_else(|_| {
            // Content outside the outputs tree gets a content-derived id.
            format!("#generated-{}", digest::cache_key(&local.to_string_lossy()))
        })
}

fn param_additional_type(values: &[InputValue]) -> &'static str {
    match values.first() {
        Some(InputValue::Scalar(ScalarValue::Bool(_))) => "Boolean",
        Some(InputValue::Scalar(ScalarValue::Int(_))) => "Integer",
        Some(InputValue::Scalar(ScalarValue::Float(_))) => "Float",
        Some(InputValue::Scalar(ScalarValue::Str(_))) => "String",
        Some(InputValue::Content(content)) => kind_additional_type(content.kind),
        None => "String",
    }
}

fn kind_additional_type(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::File => "File",
        ContentKind::Directory => "Dataset",
        ContentKind::Value => "String",
    }
}

/// Write the zipped crate: the metadata document plus, when available, the
/// workflow entry file itself (by path, never re-fetched).
async fn write_crate_zip(
    target: &Path,
    document: Value,
    workflow_id: String,
    workflow_path: Option<PathBuf>,
) -> Result<()> {
    let target = target.to_path_buf();
    spawn_blocking(move || -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {parent:?}"))?;
        }
        let file = std::fs::File::create(&target)
            .with_context(|| format!("create crate archive {target:?}"))?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        zip.start_file("ro-crate-metadata.json", options)
            .context("add metadata to crate archive")?;
        let rendered =
            serde_json::to_vec_pretty(&document).context("serialize crate metadata")?;
        zip.write_all(&rendered).context("write crate metadata")?;

        if let Some(workflow_path) = workflow_path {
            let content = std::fs::read(&workflow_path)
                .with_context(|| format!("read workflow file {workflow_path:?}"))?;
            zip.start_file(workflow_id, options)
                .context("add workflow to crate archive")?;
            zip.write_all(&content).context("write workflow file")?;
        }

        zip.finish().context("finalize crate archive")?;
        Ok(())
    })
    .await
    .context("join task")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn builder_emits_each_node_once() {
        let mut builder = CrateBuilder::new();
        builder.set("#a", "@type", Value::String("Thing".into()));
        builder.push_ref("#a", "related", "#b");
        builder.set("#b", "@type", Value::String("Thing".into()));
        // The cycle: b points back at a.
        builder.push_ref("#b", "related", "#a");
        builder.push_ref("#a", "related", "#b");

        let document = builder.finish();
        let graph = document["@graph"].as_array().unwrap();

        let a_nodes: Vec<_> = graph
            .iter()
            .filter(|node| node["@id"] == "#a")
            .collect();
        pretty_assert_eq!(a_nodes.len(), 1);
        pretty_assert_eq!(
            a_nodes[0]["related"],
            json!([{"@id": "#b"}]),
            "duplicate refs must collapse"
        );
    }

    #[test]
    fn additional_types_follow_value_shapes() {
        pretty_assert_eq!(
            param_additional_type(&[InputValue::Scalar(ScalarValue::Int(3))]),
            "Integer"
        );
        pretty_assert_eq!(
            param_additional_type(&[InputValue::Scalar(ScalarValue::Bool(true))]),
            "Boolean"
        );
        pretty_assert_eq!(kind_additional_type(ContentKind::Directory), "Dataset");
    }

    #[test]
    fn metadata_descriptor_points_at_root() {
        let document = CrateBuilder::new().finish();
        let graph = document["@graph"].as_array().unwrap();
        let descriptor = graph
            .iter()
            .find(|node| node["@id"] == "ro-crate-metadata.json")
            .unwrap();
        pretty_assert_eq!(descriptor["about"], json!({"@id": "./"}));
    }
}
