//! Shared data model for the enactment core.
//!
//! These are the value types that flow between the cache, the stager, the
//! engine adapters and the controller, and the shapes that end up inside the
//! marshalled state files. Sum types that are persisted to YAML carry an
//! explicit `kind` discriminator so the records stay readable and
//! round-trippable regardless of which component wrote them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use derive_more::Display;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

/// A security context is an opaque credential block (tokens, user/pass,
/// plugin-specific settings). It lives in memory only and is never part of
/// any persisted record.
pub type SecurityContext = BTreeMap<String, serde_yaml::Value>;

/// Credential table keyed by context name.
pub type SecurityContextTable = BTreeMap<String, SecurityContext>;

/// Exit value reported by a workflow engine, passed through faithfully.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExitVal(pub i64);

impl ExitVal {
    pub fn success(self) -> bool {
        self.0 == 0
    }
}

/// What kind of content a materialized value is.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum ContentKind {
    File,
    Directory,
    Value,
}

/// Attribution of a fetched artifact to an author or curator.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Attribution {
    pub who: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A URI together with its licence terms, attributions and (in memory only)
/// the credentials needed to dereference it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicensedUri {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributions: Vec<Attribution>,
    /// Credentials are intentionally absent from every persisted record.
    #[serde(skip)]
    pub sec_context: Option<SecurityContext>,
}

impl LicensedUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            licences: Vec::new(),
            attributions: Vec::new(),
            sec_context: None,
        }
    }
}

impl PartialEq for LicensedUri {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.licences == other.licences
            && self.attributions == other.attributions
    }
}

/// One step of a dereference chain: the URI that was visited and whatever
/// response metadata the fetcher decided to record about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UriMetadata {
    pub uri: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_name: Option<String>,
}

impl UriMetadata {
    pub fn new(uri: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            uri: uri.into(),
            metadata,
            preferred_name: None,
        }
    }
}

/// Content staged on the local disk, with full provenance of where it came
/// from and how it was dereferenced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedContent {
    pub local_path: PathBuf,
    pub licensed_uri: LicensedUri,
    pub pretty_filename: String,
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata_array: Vec<UriMetadata>,
}

/// Remote repository reference derived from a workflow id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepo {
    /// Either a remote git URL or, for pure TRS tools, the locally
    /// materialized files directory.
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
}

/// A workflow materialized on the local filesystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalWorkflow {
    pub dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    /// Resolved commit identifier after clone, always a commit hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_checkout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_version: Option<String>,
}

impl LocalWorkflow {
    /// Path to the entry file (or the workflow root when there is none).
    pub fn entrypoint(&self) -> PathBuf {
        match &self.rel_path {
            Some(rel) => self.dir.join(rel),
            None => self.dir.clone(),
        }
    }
}

/// The workflow languages this backend knows how to route to an engine
/// adapter. The registry of live adapters is keyed by this enum.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum EngineKind {
    #[strum(serialize = "cwl")]
    #[serde(rename = "cwl")]
    Cwl,
    #[strum(serialize = "nextflow")]
    #[serde(rename = "nextflow")]
    Nextflow,
}

/// Outcome of workflow resolution: which engine owns it and where it lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedWorkflow {
    pub workflow_type: EngineKind,
    pub remote_repo: RemoteRepo,
}

/// The container runtimes the core can route containers through.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum ContainerKind {
    #[strum(serialize = "docker")]
    #[serde(rename = "docker")]
    Docker,
    #[strum(serialize = "singularity")]
    #[serde(rename = "singularity")]
    Singularity,
    #[strum(serialize = "podman")]
    #[serde(rename = "podman")]
    Podman,
    #[strum(serialize = "none")]
    #[serde(rename = "none")]
    NoContainer,
}

/// A materialized container image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub kind: ContainerKind,
    /// The tag that uniquely names this image within its runtime.
    pub tagged_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// A scalar parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One value of a materialized input: either a scalar or staged content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum InputValue {
    Scalar(ScalarValue),
    Content(MaterializedContent),
}

impl InputValue {
    pub fn as_path_hint(&self) -> Option<PathBuf> {
        match self {
            InputValue::Scalar(ScalarValue::Str(s)) => Some(PathBuf::from(s)),
            InputValue::Content(content) => Some(content.local_path.clone()),
            _ => None,
        }
    }
}

/// A fully materialized input parameter, named by its linear key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedInput {
    /// Dot-separated path locating this leaf in the parameter tree.
    pub name: String,
    pub values: Vec<InputValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_inputs: Option<Vec<MaterializedContent>>,
}

impl MaterializedInput {
    pub fn scalars(name: impl Into<String>, values: Vec<ScalarValue>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(InputValue::Scalar).collect(),
            secondary_inputs: None,
        }
    }
}

/// How many values an expected output may legally bind.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Cardinality {
    pub min: u64,
    pub max: u64,
}

impl Cardinality {
    pub const ONE: Cardinality = Cardinality { min: 1, max: 1 };
    pub const OPTIONAL: Cardinality = Cardinality { min: 0, max: 1 };
    pub const ANY: Cardinality = Cardinality {
        min: 0,
        max: u64::MAX,
    };
    pub const AT_LEAST_ONE: Cardinality = Cardinality {
        min: 1,
        max: u64::MAX,
    };
}

/// An output the staging definition promises the workflow will produce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutput {
    pub name: String,
    pub kind: ContentKind,
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// A file generated by the enactment, with its content fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub local: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<LicensedUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_filename: Option<String>,
}

/// A directory generated by the enactment, with the fingerprints of its
/// contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDirectoryContent {
    pub local: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<LicensedUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_filename: Option<String>,
    #[serde(default)]
    pub values: Vec<OutputValue>,
}

/// One value of a materialized output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum OutputValue {
    File(GeneratedContent),
    Directory(GeneratedDirectoryContent),
    Value(String),
}

impl OutputValue {
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            OutputValue::File(content) => Some(&content.local),
            OutputValue::Directory(content) => Some(&content.local),
            OutputValue::Value(_) => None,
        }
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            OutputValue::File(content) => content.signature.as_deref(),
            OutputValue::Directory(content) => content.signature.as_deref(),
            OutputValue::Value(_) => None,
        }
    }
}

/// An output captured after execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedOutput {
    pub name: String,
    pub kind: ContentKind,
    pub expected_cardinality: Cardinality,
    pub values: Vec<OutputValue>,
    /// True when the output was discovered rather than declared.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// The record a workflow engine hands back after a launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagedExecution {
    pub exit_val: ExitVal,
    pub started: Timestamp,
    pub ended: Timestamp,
    #[serde(default)]
    pub augmented_inputs: Vec<MaterializedInput>,
    #[serde(default)]
    pub matched_outputs: Vec<MaterializedOutput>,
    /// Engine log files (stdout/stderr captures) under the meta tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_files: Vec<PathBuf>,
}

/// What an export action selects for upload.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum ExportItemType {
    #[strum(serialize = "param", serialize = "input")]
    #[serde(rename = "param", alias = "input")]
    Param,
    #[strum(serialize = "output")]
    #[serde(rename = "output")]
    Output,
    #[strum(serialize = "working-directory")]
    #[serde(rename = "working-directory")]
    WorkingDirectory,
}

/// One selected item of an export action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
    #[serde(rename = "type")]
    pub item_type: ExportItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An export action declared in the staging definition (or supplied later).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportAction {
    pub action_id: String,
    pub plugin_id: String,
    pub what: Vec<ExportItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_name: Option<String>,
    /// Action-specific setup overrides; never persisted.
    #[serde(skip)]
    pub setup: Option<SecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_id: Option<String>,
}

/// A persistent identifier returned by an export plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedPid {
    pub pid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<UriMetadata>,
}

/// A concrete element resolved from an [`ExportItem`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ExportElem {
    Content(MaterializedContent),
    Generated(GeneratedContent),
    GeneratedDirectory(GeneratedDirectoryContent),
}

impl ExportElem {
    pub fn local_path(&self) -> &Path {
        match self {
            ExportElem::Content(content) => &content.local_path,
            ExportElem::Generated(content) => &content.local,
            ExportElem::GeneratedDirectory(content) => &content.local,
        }
    }

    pub fn pretty_name(&self) -> String {
        match self {
            ExportElem::Content(content) => content.pretty_filename.clone(),
            ExportElem::Generated(content) => content
                .preferred_filename
                .clone()
                .unwrap_or_else(|| file_name_of(&content.local)),
            ExportElem::GeneratedDirectory(content) => content
                .preferred_filename
                .clone()
                .unwrap_or_else(|| file_name_of(&content.local)),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// An export action after it has run: the resolved elements and the pids
/// the plugin minted for them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterializedExportAction {
    pub action: ExportAction,
    pub elems: Vec<ExportElem>,
    pub pids: Vec<ExportedPid>,
    pub when: Timestamp,
}

/// Completion mark for one lifecycle stage: either the stage was attempted
/// and found damaged, or it completed at the recorded instant.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageMark {
    At(Timestamp),
    Damaged(bool),
}

impl StageMark {
    pub fn damaged() -> Self {
        StageMark::Damaged(false)
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            StageMark::At(ts) => Some(*ts),
            StageMark::Damaged(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StageMark::At(_))
    }
}

/// Which lifecycle stages of an instance have been marshalled, and when.
///
/// Invariants: `stage` requires `config`; `execution` and `export` require
/// `stage`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarshallingStatus {
    pub config: Option<StageMark>,
    pub stage: Option<StageMark>,
    pub execution: Option<StageMark>,
    pub export: Option<StageMark>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn input_value_round_trip() {
        let value = InputValue::Content(MaterializedContent {
            local_path: PathBuf::from("/work/inputs/genome.fa"),
            licensed_uri: LicensedUri::new("https://example.org/genome.fa"),
            pretty_filename: "genome.fa".into(),
            kind: ContentKind::File,
            metadata_array: vec![],
        });

        let yaml = serde_yaml::to_string(&value).unwrap();
        assert!(yaml.contains("kind: Content"));
        let back: InputValue = serde_yaml::from_str(&yaml).unwrap();
        pretty_assert_eq!(back, value);
    }

    #[test]
    fn scalar_values_stay_plain() {
        let input = MaterializedInput::scalars(
            "threads",
            vec![ScalarValue::Int(8), ScalarValue::Bool(true)],
        );
        let yaml = serde_yaml::to_string(&input).unwrap();
        let back: MaterializedInput = serde_yaml::from_str(&yaml).unwrap();
        pretty_assert_eq!(back, input);
    }

    #[test]
    fn stage_mark_serializes_as_timestamp_or_false() {
        let damaged = serde_yaml::to_string(&StageMark::damaged()).unwrap();
        assert_eq!(damaged.trim(), "false");

        let ts: Timestamp = "2024-06-01T12:00:00Z".parse().unwrap();
        let done = serde_yaml::to_string(&StageMark::At(ts)).unwrap();
        assert!(done.contains("2024-06-01"));
    }

    #[test]
    fn credentials_never_serialize() {
        let mut context = SecurityContext::new();
        context.insert("token".into(), serde_yaml::Value::String("hunter2".into()));
        let uri = LicensedUri {
            uri: "https://example.org/data.bin".into(),
            licences: vec!["https://spdx.org/licenses/CC0-1.0".into()],
            attributions: vec![],
            sec_context: Some(context),
        };

        let yaml = serde_yaml::to_string(&uri).unwrap();
        assert!(!yaml.contains("hunter2"));
    }
}
