//! Workflow-engine adapter contract.
//!
//! The core never interprets a workflow language itself; each language is
//! handled by an adapter implementing [`WorkflowEngine`]. Adapters register
//! through an [`EngineRegistry`] keyed by [`EngineKind`] and are declared to
//! the resolver through the static [`catalog`], which carries the URI
//! patterns and TRS descriptors used to recognize a workflow's language.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use lazy_regex::{Lazy, Regex, lazy_regex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::container::ContainerFactory;
use crate::error::EngineError;
use crate::types::{
    Container, ContainerKind, EngineKind, ExpectedOutput, LocalWorkflow, MaterializedInput,
    StagedExecution,
};
use crate::workdir::WorkdirLayout;

/// Static description of a workflow language, used by the resolver to match
/// RO-Crate `programmingLanguage` entries and TRS descriptor types.
#[derive(Debug)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub short_name: &'static str,
    pub display_name: &'static str,
    /// URI patterns that identify this language in RO-Crate metadata.
    pub uri_patterns: &'static [&'static Lazy<Regex>],
    /// The URL used in RO-Crate to represent the language.
    pub canonical_url: &'static str,
    /// The token GA4GH TRSv2 uses for this descriptor type.
    pub trs_descriptor: &'static str,
    pub rocrate_programming_language: &'static str,
    /// Engines are probed in ascending priority order for ambiguous
    /// workflows.
    pub priority: i32,
    pub enabled: bool,
}

static CWL_W3ID: Lazy<Regex> = lazy_regex!(r"^https?://w3id\.org/cwl/");
static CWL_COMMONWL: Lazy<Regex> = lazy_regex!(r"^https?://(?:www\.)?commonwl\.org");
static NEXTFLOW_IO: Lazy<Regex> = lazy_regex!(r"^https?://(?:www\.)?nextflow\.io");

static CWL_URI_PATTERNS: [&Lazy<Regex>; 2] = [&CWL_W3ID, &CWL_COMMONWL];
static NEXTFLOW_URI_PATTERNS: [&Lazy<Regex>; 1] = [&NEXTFLOW_IO];

static CATALOG: [EngineDescriptor; 2] = [
    // CWL detection goes first: the Nextflow sniffer is laxer.
    EngineDescriptor {
        kind: EngineKind::Cwl,
        short_name: "cwl",
        display_name: "Common Workflow Language",
        uri_patterns: &CWL_URI_PATTERNS,
        canonical_url: "https://www.commonwl.org/",
        trs_descriptor: "CWL",
        rocrate_programming_language: "#cwl",
        priority: 0,
        enabled: true,
    },
    EngineDescriptor {
        kind: EngineKind::Nextflow,
        short_name: "nextflow",
        display_name: "Nextflow",
        uri_patterns: &NEXTFLOW_URI_PATTERNS,
        canonical_url: "https://www.nextflow.io/",
        trs_descriptor: "NFL",
        rocrate_programming_language: "#nextflow",
        priority: 10,
        enabled: true,
    },
];

/// Every registered workflow language, in probe order.
pub fn catalog() -> impl Iterator<Item = &'static EngineDescriptor> {
    let mut all: Vec<&'static EngineDescriptor> =
        CATALOG.iter().filter(|desc| desc.enabled).collect();
    all.sort_by_key(|desc| desc.priority);
    all.into_iter()
}

/// Look up a language by its TRS descriptor token.
pub fn by_trs_descriptor(descriptor: &str) -> Option<&'static EngineDescriptor> {
    catalog().find(|desc| desc.trs_descriptor.eq_ignore_ascii_case(descriptor))
}

/// Look up a language by its short name (used in staging configurations).
pub fn by_short_name(name: &str) -> Option<&'static EngineDescriptor> {
    catalog().find(|desc| desc.short_name.eq_ignore_ascii_case(name))
}

pub fn descriptor_of(kind: EngineKind) -> &'static EngineDescriptor {
    CATALOG
        .iter()
        .find(|desc| desc.kind == kind)
        .expect("every engine kind has a catalog entry")
}

/// A workflow engine materialized for one instance: the live adapter plus
/// everything needed to run offline later.
#[derive(Clone)]
pub struct MaterializedEngine {
    pub instance: Arc<dyn WorkflowEngine>,
    pub kind: EngineKind,
    pub version: String,
    pub fingerprint: String,
    pub engine_path: PathBuf,
    pub workflow: LocalWorkflow,
    pub containers_path: Option<PathBuf>,
    pub containers: Option<Vec<Container>>,
    pub operational_containers: Option<Vec<Container>>,
}

impl std::fmt::Debug for MaterializedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedEngine")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint)
            .field("engine_path", &self.engine_path)
            .field("workflow", &self.workflow)
            .finish_non_exhaustive()
    }
}

impl MaterializedEngine {
    /// The human-readable engine version string, `"{short_name} {version}"`.
    pub fn version_str(&self) -> String {
        format!("{} {}", descriptor_of(self.kind).short_name, self.version)
    }

    pub fn to_record(&self) -> MaterializedEngineRecord {
        MaterializedEngineRecord {
            kind: self.kind,
            version: self.version.clone(),
            fingerprint: self.fingerprint.clone(),
            engine_path: self.engine_path.clone(),
            workflow: self.workflow.clone(),
            containers_path: self.containers_path.clone(),
            containers: self.containers.clone(),
            operational_containers: self.operational_containers.clone(),
        }
    }

    /// Re-attach a live adapter to a record read back from a marshalled
    /// stage file.
    pub fn from_record(record: MaterializedEngineRecord, instance: Arc<dyn WorkflowEngine>) -> Self {
        Self {
            instance,
            kind: record.kind,
            version: record.version,
            fingerprint: record.fingerprint,
            engine_path: record.engine_path,
            workflow: record.workflow,
            containers_path: record.containers_path,
            containers: record.containers,
            operational_containers: record.operational_containers,
        }
    }
}

/// The serializable shape of [`MaterializedEngine`]: everything except the
/// live adapter, which is re-instantiated from `kind` on unmarshal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterializedEngineRecord {
    pub kind: EngineKind,
    pub version: String,
    pub fingerprint: String,
    pub engine_path: PathBuf,
    pub workflow: LocalWorkflow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_containers: Option<Vec<Container>>,
}

/// The contract each workflow-language adapter implements.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Container runtimes this engine can drive.
    fn supported_container_types(&self) -> &[ContainerKind];

    /// Container runtimes this engine can drive under secure execution.
    fn supported_secure_container_types(&self) -> &[ContainerKind];

    /// Whether the engine reports a per-output mapping after a run (CWL
    /// style) instead of leaving outputs to be discovered by glob.
    fn has_explicit_outputs(&self) -> bool;

    /// Sniff a directory for workflow files of this language. Returns the
    /// engine version to use and a possibly refined workflow (adjusted
    /// `rel_path` or `lang_version`), or `None` when the language does not
    /// match.
    async fn identify(
        &self,
        workflow: &LocalWorkflow,
        desired_engine_version: Option<&str>,
    ) -> Result<Option<(String, LocalWorkflow)>>;

    /// Install the engine at a well-known path under the cache and
    /// fingerprint the installation.
    async fn materialize_engine(
        &self,
        workflow: &LocalWorkflow,
        engine_version: Option<&str>,
    ) -> Result<Option<MaterializedEngine>>;

    /// Resolve language-level imports into a consolidated tree and report
    /// the container tags the workflow needs.
    async fn materialize_workflow(
        &self,
        engine: MaterializedEngine,
        consolidated_dir: &Path,
        offline: bool,
    ) -> Result<(MaterializedEngine, Vec<String>)>;

    /// Containers the engine itself needs, beyond what the workflow asks
    /// for.
    fn side_containers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the workflow. Workflow-level failures are reported through the
    /// returned exit value, never retried here.
    async fn launch(
        &self,
        engine: &MaterializedEngine,
        inputs: &[MaterializedInput],
        environment: &[MaterializedInput],
        expected_outputs: &[ExpectedOutput],
    ) -> Result<StagedExecution>;
}

/// Instantiates engine adapters for a concrete instance's directories.
pub trait EngineProvider: Send + Sync {
    fn kind(&self) -> EngineKind;
    fn instantiate(&self, scope: &EngineScope) -> Result<Arc<dyn WorkflowEngine>>;
}

/// Everything an adapter needs to know about the instance it will serve.
#[derive(Clone, Debug)]
pub struct EngineScope {
    pub layout: WorkdirLayout,
    pub cache_dir: PathBuf,
    pub secure_exec: bool,
    pub allow_other: bool,
    pub writable_containers: bool,
    pub container_type: ContainerKind,
}

/// Registry of engine providers, keyed by language.
#[derive(Default)]
pub struct EngineRegistry {
    providers: HashMap<EngineKind, Arc<dyn EngineProvider>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn EngineProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn is_registered(&self, kind: EngineKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Engines available for probing, in catalog priority order.
    pub fn probe_order(&self) -> Vec<EngineKind> {
        catalog()
            .map(|desc| desc.kind)
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }

    pub fn instantiate(
        &self,
        kind: EngineKind,
        scope: &EngineScope,
    ) -> Result<Arc<dyn WorkflowEngine>> {
        let provider = self.providers.get(&kind).ok_or_else(|| EngineError::NotRegistered {
            kind: kind.to_string(),
        })?;
        provider.instantiate(scope)
    }
}

/// Consolidate the workflow, then materialize the containers it needs and
/// the ones the engine itself needs. Side-container failures degrade to an
/// empty list: the workflow containers are the ones execution cannot do
/// without.
pub async fn materialize_workflow_and_containers(
    engine: MaterializedEngine,
    factory: &dyn ContainerFactory,
    containers_dir: &Path,
    consolidated_dir: &Path,
    offline: bool,
    injectable: &[Container],
) -> Result<(MaterializedEngine, String)> {
    let instance = Arc::clone(&engine.instance);
    let (engine, container_tags) = instance
        .materialize_workflow(engine, consolidated_dir, offline)
        .await?;

    let containers = factory
        .materialize(&container_tags, containers_dir, offline, false, injectable)
        .await?;

    let side_tags = instance.side_containers();
    let operational_containers = if side_tags.is_empty() {
        Vec::new()
    } else {
        match factory
            .materialize(&side_tags, containers_dir, offline, false, &[])
            .await
        {
            Ok(containers) => containers,
            Err(err) => {
                warn!("could not materialize engine side containers: {err:#}");
                Vec::new()
            }
        }
    };

    let container_engine_version = factory.engine_version().await?;

    let engine = MaterializedEngine {
        containers_path: Some(containers_dir.to_path_buf()),
        containers: Some(containers),
        operational_containers: Some(operational_containers),
        ..engine
    };
    Ok((engine, container_engine_version))
}

/// Deploy the materialized containers into the local runtime and launch the
/// workflow.
pub async fn execute_workflow(
    engine: &MaterializedEngine,
    factory: &dyn ContainerFactory,
    inputs: &[MaterializedInput],
    environment: &[MaterializedInput],
    expected_outputs: &[ExpectedOutput],
) -> Result<StagedExecution> {
    let containers_dir = engine.containers_path.as_deref();
    if let Some(containers) = &engine.containers {
        factory.deploy(containers, containers_dir, false).await?;
    }
    if let Some(operational) = &engine.operational_containers {
        factory.deploy(operational, containers_dir, false).await?;
    }

    engine
        .instance
        .launch(engine, inputs, environment, expected_outputs)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn catalog_probes_cwl_before_nextflow() {
        let kinds: Vec<EngineKind> = catalog().map(|desc| desc.kind).collect();
        pretty_assert_eq!(kinds, vec![EngineKind::Cwl, EngineKind::Nextflow]);
    }

    #[test]
    fn trs_descriptors_resolve() {
        pretty_assert_eq!(by_trs_descriptor("CWL").unwrap().kind, EngineKind::Cwl);
        pretty_assert_eq!(
            by_trs_descriptor("nfl").unwrap().kind,
            EngineKind::Nextflow
        );
        assert!(by_trs_descriptor("GALAXY").is_none());
    }

    #[test]
    fn uri_patterns_match_language_ids() {
        let cwl = descriptor_of(EngineKind::Cwl);
        assert!(
            cwl.uri_patterns
                .iter()
                .any(|pattern| pattern.is_match("https://w3id.org/cwl/v1.2/"))
        );
        assert!(
            !cwl.uri_patterns
                .iter()
                .any(|pattern| pattern.is_match("https://www.nextflow.io/"))
        );
    }
}
