//! The enactment controller: one instance, one lifecycle.
//!
//! An instance moves through `INIT → CONFIGURED → STAGED → EXECUTED →
//! EXPORTED`, with `DAMAGED` as the side state for working directories that
//! cannot be trusted anymore. Every completed stage is marshalled into a
//! YAML record under `meta/`; re-opening an instance replays those records
//! in order instead of redoing work, which is what makes an enactment fully
//! re-openable offline. Credential tables are never part of any record: on
//! re-open the table is empty until the caller supplies it again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheHandler, CacheType};
use crate::config::{self, WorkflowMetaConfig};
use crate::container::{self, ContainerFactory, ContainerFactoryRegistry};
use crate::engine::{
    self, EngineRegistry, EngineScope, MaterializedEngine, MaterializedEngineRecord,
    WorkflowEngine,
};
use crate::error::{EngineError, SetupError, StateError};
use crate::export::{self, ExportPluginRegistry};
use crate::fetch::{self, FetcherRegistry};
use crate::fs;
use crate::outputs;
use crate::resolver::{ResolveRequest, WorkflowResolver};
use crate::rocrate;
use crate::stager::{self, InputStager};
use crate::types::{
    ContainerKind, ContentKind, EngineKind, ExitVal, ExpectedOutput, ExportAction, ExportElem,
    ExportItemType, ExportedPid, InputValue, LicensedUri, LocalWorkflow, MarshallingStatus,
    MaterializedContent, MaterializedExportAction, MaterializedInput, MaterializedOutput,
    RemoteRepo, SecurityContextTable, StageMark,
};
use crate::workdir::{
    self, MountConfig, SetupOptions, Workdir, WorkdirLayout,
};

/// Shared services every instance runs against: the caches, the adapter
/// registries, and host-level mount configuration.
pub struct Backend {
    pub cache: Arc<CacheHandler>,
    pub engines: EngineRegistry,
    pub container_factories: ContainerFactoryRegistry,
    pub export_plugins: ExportPluginRegistry,
    pub instances_dir: PathBuf,
    pub mount: MountConfig,
}

impl Backend {
    /// A backend rooted at `home`: cache under `home/cache`, instances
    /// under `home/instances`, default fetchers, no engines registered.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let client = reqwest::Client::new();
        Self {
            cache: Arc::new(CacheHandler::new(
                home.join("cache"),
                FetcherRegistry::with_defaults(client),
            )),
            engines: EngineRegistry::new(),
            container_factories: ContainerFactoryRegistry::with_defaults(),
            export_plugins: ExportPluginRegistry::new(),
            instances_dir: home.join("instances"),
            mount: MountConfig::default(),
        }
    }
}

/// The marshalled stage record.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StageState {
    repo: RemoteRepo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_effective_checkout: Option<String>,
    engine_desc: EngineKind,
    engine_version: String,
    materialized_engine: MaterializedEngineRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_engine_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workflow_engine_version: Option<String>,
    materialized_params: Vec<MaterializedInput>,
}

/// The marshalled execution record.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ExecutionState {
    exit_val: ExitVal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended: Option<Timestamp>,
    augmented_inputs: Vec<MaterializedInput>,
    matched_outputs: Vec<MaterializedOutput>,
}

/// One reproducible enactment of a workflow on this host.
pub struct WorkflowInstance {
    backend: Arc<Backend>,
    instance_id: String,
    nickname: String,
    creation: Timestamp,
    raw_dir: PathBuf,
    workdir: Workdir,

    config: WorkflowMetaConfig,
    formatted_params: serde_yaml::Value,
    expected_outputs: Vec<ExpectedOutput>,
    default_actions: Vec<ExportAction>,
    /// In memory only; reset to empty on every re-open.
    credentials: SecurityContextTable,
    paranoid: bool,

    repo: Option<RemoteRepo>,
    repo_effective_checkout: Option<String>,
    engine_kind: Option<EngineKind>,
    engine_version: Option<String>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    local_workflow: Option<LocalWorkflow>,
    materialized_engine: Option<MaterializedEngine>,
    container_engine_version: Option<String>,
    workflow_engine_version: Option<String>,
    materialized_params: Option<Vec<MaterializedInput>>,
    /// Sequence number of the last staged input, continued by injection.
    last_input: usize,

    exit_val: Option<ExitVal>,
    execution_started: Option<Timestamp>,
    execution_ended: Option<Timestamp>,
    augmented_inputs: Option<Vec<MaterializedInput>>,
    matched_outputs: Option<Vec<MaterializedOutput>>,
    run_export_actions: Vec<MaterializedExportAction>,

    config_marshalled: Option<StageMark>,
    stage_marshalled: Option<StageMark>,
    execution_marshalled: Option<StageMark>,
    export_marshalled: Option<StageMark>,
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("instance_id", &self.instance_id)
            .field("nickname", &self.nickname)
            .field("raw_dir", &self.raw_dir)
            .finish_non_exhaustive()
    }
}

impl WorkflowInstance {
    /// Create a brand-new staged working directory for a parsed staging
    /// definition.
    #[instrument(skip_all, fields(workflow_id = %config.workflow_id))]
    pub async fn create(
        backend: Arc<Backend>,
        mut config: WorkflowMetaConfig,
        credentials: SecurityContextTable,
        nickname_prefix: Option<&str>,
        paranoid: bool,
    ) -> Result<Self> {
        // A paranoid mode preserved in the definition must be honoured.
        let paranoid = config.paranoid_mode || paranoid;
        config.paranoid_mode = paranoid;

        if let Some(prefix) = nickname_prefix {
            config.nickname = Some(format!(
                "{prefix}{}",
                config.nickname.as_deref().unwrap_or_default()
            ));
        }

        let instance_id = Uuid::new_v4().to_string();
        let nickname = config.nickname.clone().unwrap_or_else(|| instance_id.clone());
        let raw_dir = backend.instances_dir.join(&instance_id);

        let options = SetupOptions {
            secure: config.workflow_config.secure(),
            paranoid,
            mount: backend.mount.clone(),
            fail_ok: false,
        };
        let workdir = Workdir::setup(&raw_dir, &options).await?;
        let layout = workdir
            .layout()
            .ok_or_else(|| SetupError::IncompleteWorkdir {
                work_dir: raw_dir.clone(),
            })?
            .clone();
        layout.materialize().await?;
        fs::ensure_dir(&layout.meta_dir).await?;

        let mut instance = Self::assemble(
            backend,
            instance_id,
            nickname,
            Timestamp::now(),
            raw_dir,
            workdir,
            config,
            credentials,
            paranoid,
        )?;
        instance.marshall_config(true).await?;
        Ok(instance)
    }

    /// Create a new instance from a staging definition file plus an
    /// optional credentials file.
    pub async fn from_files(
        backend: Arc<Backend>,
        workflow_meta_file: &Path,
        security_contexts_file: Option<&Path>,
        nickname_prefix: Option<&str>,
        paranoid: bool,
    ) -> Result<Self> {
        let config = config::load_staging_config(workflow_meta_file).await?;
        let credentials = match security_contexts_file {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                config::load_security_contexts(path).await?
            }
            _ => SecurityContextTable::new(),
        };
        Self::create(backend, config, credentials, nickname_prefix, paranoid).await
    }

    /// Re-open an existing staged working directory, replaying its
    /// marshalled records in order and stopping at the first absent one.
    #[instrument(skip(backend))]
    pub async fn from_work_dir(
        backend: Arc<Backend>,
        raw_dir: &Path,
        fail_ok: bool,
    ) -> Result<Self> {
        let raw_dir = tokio::fs::canonicalize(raw_dir)
            .await
            .with_context(|| format!("canonicalize {raw_dir:?}"))?;
        let instance_id = raw_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| eyre!("raw working directory {raw_dir:?} has no name"))?;

        let secure = Workdir::has_passphrase(&raw_dir).await;
        let options = SetupOptions {
            secure,
            paranoid: false,
            mount: backend.mount.clone(),
            fail_ok,
        };
        let mut workdir = Workdir::setup(&raw_dir, &options).await?;

        let creation = tokio::fs::metadata(&raw_dir)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|mtime| Timestamp::try_from(mtime).ok())
            .unwrap_or_else(Timestamp::now);

        let Some(layout) = workdir.layout().cloned() else {
            return Err(SetupError::IncompleteWorkdir {
                work_dir: raw_dir.clone(),
            }
            .into());
        };

        let meta_exists = tokio::fs::try_exists(&layout.meta_dir).await.unwrap_or(false);
        if !meta_exists {
            let err = SetupError::IncompleteWorkdir {
                work_dir: layout.work_dir.clone(),
            };
            if !fail_ok {
                return Err(err.into());
            }
            error!("{err}");
            workdir.mark_damaged();
        }

        let placeholder_config = WorkflowMetaConfig {
            workflow_id: String::new(),
            version: None,
            workflow_type: None,
            trs_endpoint: None,
            nickname: None,
            paranoid_mode: false,
            workflow_config: Default::default(),
            params: serde_yaml::Value::Mapping(Default::default()),
            placeholders: serde_yaml::Value::Mapping(Default::default()),
            outputs: serde_yaml::Value::Mapping(Default::default()),
            default_actions: None,
        };

        let mut instance = Self::assemble(
            backend,
            instance_id.clone(),
            instance_id,
            creation,
            raw_dir,
            workdir,
            placeholder_config,
            SecurityContextTable::new(),
            false,
        )?;

        if meta_exists {
            let unmarshalled = instance.unmarshall_config(fail_ok).await?;
            if unmarshalled.is_none_or(|mark| !mark.is_complete()) {
                instance.workdir.mark_damaged();
            } else {
                // Replay the rest of the lifecycle as far as it got.
                instance.unmarshall_stage(true, true).await?;
                instance.unmarshall_execute(true, true).await?;
                instance.unmarshall_export(true, true).await?;
            }
        } else {
            instance.config_marshalled = Some(StageMark::damaged());
        }

        Ok(instance)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        backend: Arc<Backend>,
        instance_id: String,
        nickname: String,
        creation: Timestamp,
        raw_dir: PathBuf,
        workdir: Workdir,
        config: WorkflowMetaConfig,
        credentials: SecurityContextTable,
        paranoid: bool,
    ) -> Result<Self> {
        let formatted_params =
            stager::format_params(&config.params, &config.placeholder_table())?;
        let expected_outputs = outputs::parse_expected_outputs(&config.outputs)?;
        let default_actions = match &config.default_actions {
            Some(raw) => export::parse_export_actions(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            backend,
            instance_id,
            nickname,
            creation,
            raw_dir,
            workdir,
            config,
            formatted_params,
            expected_outputs,
            default_actions,
            credentials,
            paranoid,
            repo: None,
            repo_effective_checkout: None,
            engine_kind: None,
            engine_version: None,
            engine: None,
            local_workflow: None,
            materialized_engine: None,
            container_engine_version: None,
            workflow_engine_version: None,
            materialized_params: None,
            last_input: 0,
            exit_val: None,
            execution_started: None,
            execution_ended: None,
            augmented_inputs: None,
            matched_outputs: None,
            run_export_actions: Vec::new(),
            config_marshalled: None,
            stage_marshalled: None,
            execution_marshalled: None,
            export_marshalled: None,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn creation(&self) -> Timestamp {
        self.creation
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn is_damaged(&self) -> bool {
        self.workdir.is_damaged()
    }

    pub fn exit_val(&self) -> Option<ExitVal> {
        self.exit_val
    }

    pub fn matched_outputs(&self) -> Option<&[MaterializedOutput]> {
        self.matched_outputs.as_deref()
    }

    pub fn materialized_params(&self) -> Option<&[MaterializedInput]> {
        self.materialized_params.as_deref()
    }

    pub fn local_workflow(&self) -> Option<&LocalWorkflow> {
        self.local_workflow.as_ref()
    }

    pub fn repo_effective_checkout(&self) -> Option<&str> {
        self.repo_effective_checkout.as_deref()
    }

    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.engine_kind
    }

    /// Supply (or replace) the in-memory credentials table.
    pub fn set_credentials(&mut self, credentials: SecurityContextTable) {
        self.credentials = credentials;
    }

    pub fn marshalling_status(&self) -> MarshallingStatus {
        MarshallingStatus {
            config: self.config_marshalled,
            stage: self.stage_marshalled,
            execution: self.execution_marshalled,
            export: self.export_marshalled,
        }
    }

    fn layout(&self) -> Result<&WorkdirLayout> {
        self.workdir.layout().ok_or_else(|| {
            StateError::Damaged {
                instance_id: self.instance_id.clone(),
            }
            .into()
        })
    }

    fn engine_scope(&self) -> Result<EngineScope> {
        let layout = self.layout()?.clone();
        Ok(EngineScope {
            layout,
            cache_dir: self.backend.cache.cache_dir().clone(),
            secure_exec: self.config.workflow_config.secure() || self.paranoid,
            allow_other: self.workdir.allow_other(),
            writable_containers: self.config.workflow_config.writable_containers(),
            container_type: self.container_type(),
        })
    }

    fn container_type(&self) -> ContainerKind {
        self.config
            .workflow_config
            .container_type
            .unwrap_or(ContainerKind::NoContainer)
    }

    fn container_factory(&self) -> Result<Arc<dyn ContainerFactory>> {
        let factory = self.backend.container_factories.get(self.container_type())?;
        container::check_secure_exec(
            factory.as_ref(),
            self.config.workflow_config.secure() || self.paranoid,
            self.workdir.allow_other(),
            self.config.workflow_config.writable_containers(),
        )?;
        Ok(factory)
    }

    /// Fetch the workflow: resolve the reference, materialize the repo into
    /// the instance's workflow directory, and identify the engine.
    #[instrument(skip(self))]
    pub async fn fetch_workflow(&mut self, offline: bool) -> Result<()> {
        let layout = self.layout()?.clone();
        let resolver = WorkflowResolver::new(&self.backend.cache);
        let resolved = resolver
            .resolve(&ResolveRequest {
                workflow_id: &self.config.workflow_id,
                version_id: self.config.version.as_deref(),
                descriptor_type: self.config.workflow_type.as_deref(),
                trs_endpoint: self.config.trs_endpoint.as_deref(),
                meta_dir: &layout.meta_dir,
                offline,
            })
            .await?;

        let repo = resolved.repo.clone();
        let mut effective_checkout = None;

        // A repo_url with a scheme is a remote repository to clone; a bare
        // path points at already-materialized content (pure TRS tools).
        let repo_dir = if fetch::scheme_of(&repo.repo_url).is_some() {
            let mut uri = repo.repo_url.clone();
            if uri.starts_with("http://") || uri.starts_with("https://") || uri.starts_with("file://")
            {
                uri = format!("git+{uri}");
            }
            if let Some(tag) = &repo.tag {
                uri = format!("{uri}#{tag}");
            }
            let fetched = self
                .backend
                .cache
                .fetch(&LicensedUri::new(uri), CacheType::Workflow, offline)
                .await
                .with_context(|| format!("materialize workflow repository {}", repo.repo_url))?;
            effective_checkout = fetched
                .last_metadata()
                .and_then(|step| step.metadata.get("effective_checkout"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            fetched.local_path
        } else {
            PathBuf::from(&repo.repo_url)
        };

        // The instance keeps its own isolated copy of the workflow so local
        // modifications cannot poison the shared cache.
        if tokio::fs::try_exists(&layout.workflow_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&layout.workflow_dir)
                .await
                .with_context(|| format!("clear {:?}", layout.workflow_dir))?;
        }
        fs::link_or_copy(&repo_dir, &layout.workflow_dir, true).await?;
        info!(
            checkout = ?effective_checkout,
            dir = ?layout.workflow_dir,
            "materialized workflow repository"
        );

        if let Some(rel_path) = &repo.rel_path {
            let entry = layout.workflow_dir.join(rel_path);
            if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                return Err(eyre!(
                    "relative path {rel_path:?} cannot be found in materialized workflow repository {:?}",
                    layout.workflow_dir
                ));
            }
        }

        let local_workflow = LocalWorkflow {
            dir: layout.workflow_dir.clone(),
            rel_path: repo.rel_path.clone(),
            effective_checkout: effective_checkout.clone(),
            lang_version: None,
        };

        // A valid engine must recognize the fetched content.
        let scope = self.engine_scope()?;
        let (engine_kind, engine, engine_version, local_workflow) = match resolved.engine {
            Some(kind) => {
                let engine = self.backend.engines.instantiate(kind, &scope)?;
                let identified = engine.identify(&local_workflow, None).await?;
                let Some((version, refined)) = identified else {
                    return Err(EngineError::NotRecognized {
                        location: repo.repo_url.clone(),
                    }
                    .into());
                };
                (kind, engine, version, refined)
            }
            None => {
                let mut found = None;
                for kind in self.backend.engines.probe_order() {
                    debug!(%kind, "testing engine");
                    let engine = self.backend.engines.instantiate(kind, &scope)?;
                    if let Some((version, refined)) =
                        engine.identify(&local_workflow, None).await?
                    {
                        found = Some((kind, engine, version, refined));
                        break;
                    }
                }
                found.ok_or_else(|| EngineError::NotRecognized {
                    location: repo.repo_url.clone(),
                })?
            }
        };

        self.repo = Some(repo);
        self.repo_effective_checkout = effective_checkout;
        self.engine_kind = Some(engine_kind);
        self.engine = Some(engine);
        self.engine_version = Some(engine_version);
        self.local_workflow = Some(local_workflow);
        Ok(())
    }

    /// Materialize the engine installation for the identified workflow.
    #[instrument(skip(self))]
    pub async fn setup_engine(&mut self, offline: bool) -> Result<()> {
        if self.engine.is_none() {
            self.fetch_workflow(offline).await?;
        }
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| eyre!("workflow engine not properly identified or set up"))?;

        let workflow = match &self.materialized_engine {
            Some(materialized) => materialized.workflow.clone(),
            None => self
                .local_workflow
                .clone()
                .ok_or_else(|| eyre!("no local workflow to set the engine up for"))?,
        };

        let materialized = engine
            .materialize_engine(&workflow, self.engine_version.as_deref())
            .await?;

        if let Some(mut materialized) = materialized {
            self.workflow_engine_version = Some(materialized.version_str());
            // Keep container state gathered by a previous materialization.
            if let Some(previous) = &self.materialized_engine {
                materialized.containers_path = previous.containers_path.clone();
                materialized.containers = previous.containers.clone();
                materialized.operational_containers = previous.operational_containers.clone();
            }
            self.materialized_engine = Some(materialized);
        }
        Ok(())
    }

    /// Consolidate the workflow tree and materialize its containers.
    #[instrument(skip(self))]
    pub async fn materialize_workflow(&mut self, offline: bool) -> Result<()> {
        if self.materialized_engine.is_none() {
            self.setup_engine(offline).await?;
        }
        let materialized = self
            .materialized_engine
            .clone()
            .ok_or_else(|| eyre!("the materialized workflow engine should be available"))?;

        if materialized.containers.is_some() {
            return Ok(());
        }

        let layout = self.layout()?.clone();
        if !offline {
            fs::ensure_dir(&layout.containers_dir).await?;
        }

        let factory = self.container_factory()?;
        let (materialized, container_engine_version) = engine::materialize_workflow_and_containers(
            materialized,
            factory.as_ref(),
            &layout.containers_dir,
            &layout.consolidated_workflow_dir,
            offline,
            &[],
        )
        .await?;

        self.materialized_engine = Some(materialized);
        self.container_engine_version = Some(container_engine_version);
        Ok(())
    }

    /// Materialize every input parameter into the inputs directory.
    #[instrument(skip(self))]
    pub async fn materialize_inputs(&mut self, offline: bool) -> Result<()> {
        let layout = self.layout()?.clone();
        let stager = InputStager::new(
            &self.backend.cache,
            &layout.inputs_dir,
            &layout.outputs_dir,
            &self.credentials,
            self.paranoid,
        );
        let (materialized, last_input) =
            stager.materialize(&self.formatted_params, offline).await?;
        self.materialized_params = Some(materialized);
        self.last_input = last_input;
        Ok(())
    }

    /// Stage extra local paths into the inputs directory, as if they had
    /// been declared with `file:` URIs. Injected inputs continue the input
    /// sequence numbering and are always hardened with their sequence
    /// prefix.
    #[instrument(skip(self, paths))]
    pub async fn inject_inputs(
        &mut self,
        paths: &[PathBuf],
        offline: bool,
    ) -> Result<Vec<MaterializedContent>> {
        let layout = self.layout()?.clone();
        let stager = InputStager::new(
            &self.backend.cache,
            &layout.inputs_dir,
            &layout.outputs_dir,
            &self.credentials,
            self.paranoid,
        );
        let (staged, last_input) = stager
            .inject_inputs(paths, offline, self.last_input)
            .await?;
        self.last_input = last_input;
        Ok(staged)
    }

    /// The full staging pipeline: fetch, engine setup, workflow and input
    /// materialization, then the stage marshal.
    #[instrument(skip(self))]
    pub async fn stage_work_dir(&mut self, offline: bool) -> Result<StageMark> {
        self.fetch_workflow(offline).await?;
        self.setup_engine(offline).await?;
        self.materialize_workflow(offline).await?;
        self.materialize_inputs(offline).await?;
        self.marshall_stage(true, false)
            .await?
            .ok_or_else(|| eyre!("stage marshalling did not complete"))
    }

    /// Execute the staged workflow and marshal the execution record.
    /// Returns the engine's exit value faithfully.
    #[instrument(skip(self))]
    pub async fn execute_workflow(&mut self, offline: bool) -> Result<ExitVal> {
        self.unmarshall_stage(offline, false).await?;

        let materialized = self
            .materialized_engine
            .clone()
            .ok_or_else(|| eyre!("stage state carries no materialized engine"))?;
        let params = self
            .materialized_params
            .clone()
            .ok_or_else(|| eyre!("stage state carries no materialized params"))?;

        let factory = self.container_factory()?;
        let execution = engine::execute_workflow(
            &materialized,
            factory.as_ref(),
            &params,
            &[],
            &self.expected_outputs,
        )
        .await?;

        debug!(exit_val = %execution.exit_val, "workflow execution finished");
        self.exit_val = Some(execution.exit_val);
        self.execution_started = Some(execution.started);
        self.execution_ended = Some(execution.ended);
        self.augmented_inputs = Some(execution.augmented_inputs);
        self.matched_outputs = Some(execution.matched_outputs);
        self.marshall_execute(true, false).await?;

        Ok(execution.exit_val)
    }

    /// Run export actions (the supplied ones, or the defaults from the
    /// staging definition), optionally filtered by action id. Failed
    /// actions are collected; with `fail_ok` they are returned to the
    /// caller instead of failing the call.
    #[instrument(skip(self, actions, credentials))]
    pub async fn export_results(
        &mut self,
        actions: Option<Vec<ExportAction>>,
        credentials: Option<&SecurityContextTable>,
        action_ids: &[String],
        fail_ok: bool,
    ) -> Result<(
        Vec<MaterializedExportAction>,
        Vec<(ExportAction, color_eyre::Report)>,
    )> {
        if self.unmarshall_export(true, true).await?.is_none() {
            return Err(StateError::MissingPrerequisite {
                operation: "export results".into(),
                prerequisite: "stage".into(),
            }
            .into());
        }
        // A previously failed execution may still be worth exporting.
        self.unmarshall_execute(true, true).await?;

        let actions = actions.unwrap_or_else(|| self.default_actions.clone());
        let filtered: Vec<ExportAction> = if action_ids.is_empty() {
            actions
        } else {
            actions
                .into_iter()
                .filter(|action| action_ids.contains(&action.action_id))
                .collect()
        };

        let empty = SecurityContextTable::new();
        let credentials = credentials.unwrap_or(&empty);

        let mut materialized_actions = Vec::new();
        let mut action_errors = Vec::new();
        for action in filtered {
            match self.run_export_action(&action, credentials).await {
                Ok(materialized) => materialized_actions.push(materialized),
                Err(err) => {
                    error!(
                        action = %action.action_id,
                        plugin = %action.plugin_id,
                        "export action failed: {err:#}"
                    );
                    action_errors.push((action, err));
                }
            }
        }

        if !action_errors.is_empty() && !fail_ok {
            let summary = action_errors
                .iter()
                .map(|(action, err)| format!("{}: {err}", action.action_id))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(crate::error::ExportError::ActionsFailed { summary }.into());
        }

        let any_succeeded = !materialized_actions.is_empty();
        self.run_export_actions.extend(materialized_actions.clone());
        self.marshall_export(true, any_succeeded).await?;

        Ok((materialized_actions, action_errors))
    }

    async fn run_export_action(
        &self,
        action: &ExportAction,
        credentials: &SecurityContextTable,
    ) -> Result<MaterializedExportAction> {
        let elems = self.locate_export_items(&action.what)?;
        let setup = export::merge_action_setup(action, credentials)?;
        let plugin = self
            .backend
            .export_plugins
            .instantiate(&action.plugin_id, setup.as_ref())?;

        let pids: Vec<ExportedPid> = plugin
            .push(
                &elems,
                action.preferred_scheme.as_deref(),
                action.preferred_id.as_deref(),
            )
            .await?;

        Ok(MaterializedExportAction {
            action: action.clone(),
            elems,
            pids,
            when: Timestamp::now(),
        })
    }

    /// Resolve export items to concrete local content: params by linear
    /// key, outputs by name, or whole directories.
    pub fn locate_export_items(&self, items: &[crate::types::ExportItem]) -> Result<Vec<ExportElem>> {
        let layout = self.layout()?;
        let mut elems = Vec::new();

        for item in items {
            match item.item_type {
                ExportItemType::Param => {
                    if !self.stage_marshalled.is_some_and(|mark| mark.is_complete()) {
                        return Err(StateError::MissingPrerequisite {
                            operation: format!("export inputs of {}", self.instance_id),
                            prerequisite: "stage".into(),
                        }
                        .into());
                    }
                    match &item.name {
                        Some(name) => {
                            let params = self
                                .materialized_params
                                .as_ref()
                                .ok_or_else(|| eyre!("no materialized params available"))?;
                            let param = params
                                .iter()
                                .find(|param| &param.name == name)
                                .ok_or_else(|| crate::error::ExportError::UnknownItem {
                                    what: "param".into(),
                                    name: name.clone(),
                                })?;
                            elems.extend(param.values.iter().filter_map(|value| match value {
                                InputValue::Content(content) => {
                                    Some(ExportElem::Content(content.clone()))
                                }
                                InputValue::Scalar(_) => None,
                            }));
                            if let Some(secondary) = &param.secondary_inputs {
                                elems.extend(
                                    secondary
                                        .iter()
                                        .map(|content| ExportElem::Content(content.clone())),
                                );
                            }
                        }
                        None => elems.push(self.whole_dir_elem(&layout.inputs_dir, "inputs")),
                    }
                }
                ExportItemType::Output => {
                    if !self
                        .execution_marshalled
                        .is_some_and(|mark| mark.is_complete())
                    {
                        return Err(StateError::MissingPrerequisite {
                            operation: format!("export outputs of {}", self.instance_id),
                            prerequisite: "execution".into(),
                        }
                        .into());
                    }
                    match &item.name {
                        Some(name) => {
                            let outputs = self
                                .matched_outputs
                                .as_ref()
                                .ok_or_else(|| eyre!("no matched outputs available"))?;
                            let output = outputs
                                .iter()
                                .find(|output| &output.name == name)
                                .ok_or_else(|| crate::error::ExportError::UnknownItem {
                                    what: "output".into(),
                                    name: name.clone(),
                                })?;
                            elems.extend(output.values.iter().filter_map(|value| match value {
                                crate::types::OutputValue::File(content) => {
                                    Some(ExportElem::Generated(content.clone()))
                                }
                                crate::types::OutputValue::Directory(content) => {
                                    Some(ExportElem::GeneratedDirectory(content.clone()))
                                }
                                crate::types::OutputValue::Value(_) => None,
                            }));
                        }
                        None => elems.push(self.whole_dir_elem(&layout.outputs_dir, "outputs")),
                    }
                }
                ExportItemType::WorkingDirectory => {
                    elems.push(ExportElem::Content(MaterializedContent {
                        local_path: layout.work_dir.clone(),
                        licensed_uri: LicensedUri::new(format!(
                            "stagehand:{}",
                            self.instance_id
                        )),
                        pretty_filename: self.instance_id.clone(),
                        kind: ContentKind::Directory,
                        metadata_array: vec![],
                    }));
                }
            }
        }
        Ok(elems)
    }

    fn whole_dir_elem(&self, dir: &Path, pretty: &str) -> ExportElem {
        ExportElem::Content(MaterializedContent {
            local_path: dir.to_path_buf(),
            licensed_uri: LicensedUri::new(format!("stagehand:{}/{pretty}", self.instance_id)),
            pretty_filename: pretty.to_string(),
            kind: ContentKind::Directory,
            metadata_array: vec![],
        })
    }

    /// Write the staged RO-Crate next to the outputs.
    pub async fn create_stage_crate(&mut self, filename: Option<PathBuf>) -> Result<PathBuf> {
        self.unmarshall_stage(true, false).await?;
        rocrate::write_stage_crate(self, filename).await
    }

    /// Write the execution RO-Crate next to the outputs.
    pub async fn create_execution_crate(&mut self, filename: Option<PathBuf>) -> Result<PathBuf> {
        self.unmarshall_execute(true, false).await?;
        rocrate::write_execution_crate(self, filename).await
    }

    /// Unmount (when encrypted) and release the working directory.
    pub async fn cleanup(self) -> Result<()> {
        self.workdir.cleanup().await
    }

    // --- marshalling -----------------------------------------------------

    /// Marshal the configuration record. Idempotent unless `overwrite`.
    #[instrument(skip(self))]
    pub async fn marshall_config(&mut self, overwrite: bool) -> Result<StageMark> {
        let layout = self.layout()?;
        let path = layout.meta_file(workdir::WORKFLOW_META_FILE);

        if overwrite || !self.config_marshalled.is_some_and(|mark| mark.is_complete()) {
            let exists_nonempty = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.len() > 0)
                .unwrap_or(false);
            if overwrite || !exists_nonempty {
                let rendered = serde_yaml::to_string(&self.config)
                    .context("serialize staging definition")?;
                fs::atomic_write(&path, rendered.as_bytes()).await?;
            }
            self.config_marshalled = Some(file_mark(&path).await?);
        }
        Ok(self.config_marshalled.unwrap_or_else(StageMark::damaged))
    }

    /// Replay the configuration record from disk.
    #[instrument(skip(self))]
    pub async fn unmarshall_config(&mut self, fail_ok: bool) -> Result<Option<StageMark>> {
        if self.config_marshalled.is_some() {
            return Ok(self.config_marshalled);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::WORKFLOW_META_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(?path, "marshalled config file does not exist");
            self.config_marshalled = Some(StageMark::damaged());
            return Ok(self.config_marshalled);
        }

        let outcome: Result<()> = async {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {path:?}"))?;
            let config = config::parse_staging_config(&raw)
                .with_context(|| format!("unmarshal config {path:?}"))?;

            self.paranoid = config.paranoid_mode;
            self.nickname = config
                .nickname
                .clone()
                .unwrap_or_else(|| self.instance_id.clone());
            self.formatted_params =
                stager::format_params(&config.params, &config.placeholder_table())?;
            self.expected_outputs = outputs::parse_expected_outputs(&config.outputs)?;
            self.default_actions = match &config.default_actions {
                Some(raw) => export::parse_export_actions(raw)?,
                None => Vec::new(),
            };
            self.config = config;
            // Credentials are never persisted; a re-opened instance starts
            // with an empty table.
            self.credentials = SecurityContextTable::new();
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.config_marshalled = Some(file_mark(&path).await?);
                Ok(self.config_marshalled)
            }
            Err(err) => {
                self.config_marshalled = Some(StageMark::damaged());
                if fail_ok {
                    warn!("unmarshalling config failed: {err:#}");
                    Ok(self.config_marshalled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Marshal the stage record. Requires a marshalled config.
    #[instrument(skip(self))]
    pub async fn marshall_stage(
        &mut self,
        exist_ok: bool,
        overwrite: bool,
    ) -> Result<Option<StageMark>> {
        if !overwrite && self.stage_marshalled.is_some_and(|mark| mark.is_complete()) {
            if !exist_ok {
                return Err(StateError::AlreadyMarshalled {
                    stage: "stage".into(),
                }
                .into());
            }
            return Ok(self.stage_marshalled);
        }

        if !self.marshall_config(overwrite).await?.is_complete() {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::STAGE_STATE_FILE);
        let already = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if already && !overwrite && !exist_ok {
            return Err(StateError::AlreadyMarshalled {
                stage: "stage".into(),
            }
            .into());
        }

        if !already || overwrite {
            let materialized = self
                .materialized_engine
                .as_ref()
                .ok_or_else(|| eyre!("the engine should have been materialized by now"))?;
            let state = StageState {
                repo: self
                    .repo
                    .clone()
                    .ok_or_else(|| eyre!("no repository recorded for this instance"))?,
                repo_effective_checkout: self.repo_effective_checkout.clone(),
                engine_desc: materialized.kind,
                engine_version: self.engine_version.clone().unwrap_or_default(),
                materialized_engine: materialized.to_record(),
                container_engine_version: self.container_engine_version.clone(),
                workflow_engine_version: self.workflow_engine_version.clone(),
                materialized_params: self.materialized_params.clone().unwrap_or_default(),
            };
            debug!(?path, "creating marshalled stage file");
            let rendered = serde_yaml::to_string(&state).context("serialize stage state")?;
            fs::atomic_write(&path, rendered.as_bytes()).await?;
        }

        self.stage_marshalled = Some(file_mark(&path).await?);
        Ok(self.stage_marshalled)
    }

    /// Replay the stage record, re-instantiating the engine adapter
    /// recorded in it so downstream operations have a live engine.
    #[instrument(skip(self))]
    pub async fn unmarshall_stage(
        &mut self,
        offline: bool,
        fail_ok: bool,
    ) -> Result<Option<StageMark>> {
        if self.stage_marshalled.is_some() {
            return Ok(self.stage_marshalled);
        }

        let config_mark = self.unmarshall_config(fail_ok).await?;
        if config_mark.is_none_or(|mark| !mark.is_complete()) {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::STAGE_STATE_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let err = StateError::MissingPrerequisite {
                operation: "replay stage state".into(),
                prerequisite: "stage".into(),
            };
            self.stage_marshalled = Some(StageMark::damaged());
            if fail_ok {
                debug!(?path, "stage state was not stored");
                return Ok(self.stage_marshalled);
            }
            return Err(err.into());
        }

        let outcome: Result<()> = async {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {path:?}"))?;
            let state: StageState =
                serde_yaml::from_str(&raw).with_context(|| format!("unmarshal {path:?}"))?;

            let scope = self.engine_scope()?;
            let live = self
                .backend
                .engines
                .instantiate(state.materialized_engine.kind, &scope)?;

            self.repo = Some(state.repo);
            self.repo_effective_checkout = state.repo_effective_checkout;
            self.engine_kind = Some(state.engine_desc);
            self.engine_version = Some(state.engine_version);
            self.container_engine_version = state.container_engine_version;
            self.workflow_engine_version = state.workflow_engine_version;
            self.materialized_params = Some(state.materialized_params);
            self.local_workflow = Some(state.materialized_engine.workflow.clone());
            self.engine = Some(Arc::clone(&live));
            self.materialized_engine = Some(MaterializedEngine::from_record(
                state.materialized_engine,
                live,
            ));
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.stage_marshalled = Some(file_mark(&path).await?);
                Ok(self.stage_marshalled)
            }
            Err(err) => {
                self.stage_marshalled = Some(StageMark::damaged());
                if fail_ok {
                    warn!("unmarshalling stage state failed: {err:#}");
                    Ok(self.stage_marshalled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Marshal the execution record. Requires a marshalled stage.
    #[instrument(skip(self))]
    pub async fn marshall_execute(
        &mut self,
        exist_ok: bool,
        overwrite: bool,
    ) -> Result<Option<StageMark>> {
        if !overwrite
            && self
                .execution_marshalled
                .is_some_and(|mark| mark.is_complete())
        {
            if !exist_ok {
                return Err(StateError::AlreadyMarshalled {
                    stage: "execution".into(),
                }
                .into());
            }
            return Ok(self.execution_marshalled);
        }

        if self.marshall_stage(exist_ok, overwrite).await?.is_none() {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::EXECUTION_STATE_FILE);
        let already = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if already && !overwrite && !exist_ok {
            return Err(StateError::AlreadyMarshalled {
                stage: "execution".into(),
            }
            .into());
        }

        if !already || overwrite {
            let state = ExecutionState {
                exit_val: self
                    .exit_val
                    .ok_or_else(|| eyre!("no execution to marshal"))?,
                started: self.execution_started,
                ended: self.execution_ended,
                augmented_inputs: self.augmented_inputs.clone().unwrap_or_default(),
                matched_outputs: self.matched_outputs.clone().unwrap_or_default(),
            };
            debug!(?path, "creating marshalled execution file");
            let rendered = serde_yaml::to_string(&state).context("serialize execution state")?;
            fs::atomic_write(&path, rendered.as_bytes()).await?;
        }

        self.execution_marshalled = Some(file_mark(&path).await?);
        Ok(self.execution_marshalled)
    }

    /// Replay the execution record.
    #[instrument(skip(self))]
    pub async fn unmarshall_execute(
        &mut self,
        offline: bool,
        fail_ok: bool,
    ) -> Result<Option<StageMark>> {
        if self.execution_marshalled.is_some() {
            return Ok(self.execution_marshalled);
        }

        let stage_mark = self.unmarshall_stage(offline, fail_ok).await?;
        if stage_mark.is_none_or(|mark| !mark.is_complete()) {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::EXECUTION_STATE_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.execution_marshalled = Some(StageMark::damaged());
            if fail_ok {
                debug!(?path, "execution state was not stored");
                return Ok(self.execution_marshalled);
            }
            return Err(StateError::MissingPrerequisite {
                operation: "replay execution state".into(),
                prerequisite: "execution".into(),
            }
            .into());
        }

        let outcome: Result<()> = async {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {path:?}"))?;
            let state: ExecutionState =
                serde_yaml::from_str(&raw).with_context(|| format!("unmarshal {path:?}"))?;
            self.exit_val = Some(state.exit_val);
            self.execution_started = state.started;
            self.execution_ended = state.ended;
            self.augmented_inputs = Some(state.augmented_inputs);
            self.matched_outputs = Some(state.matched_outputs);
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.execution_marshalled = Some(file_mark(&path).await?);
                Ok(self.execution_marshalled)
            }
            Err(err) => {
                self.execution_marshalled = Some(StageMark::damaged());
                if fail_ok {
                    warn!("unmarshalling execution state failed: {err:#}");
                    Ok(self.execution_marshalled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Marshal the export record (the accumulated actions, including those
    /// of earlier sessions). Requires a marshalled stage.
    #[instrument(skip(self))]
    pub async fn marshall_export(
        &mut self,
        exist_ok: bool,
        overwrite: bool,
    ) -> Result<Option<StageMark>> {
        if !overwrite && self.export_marshalled.is_some_and(|mark| mark.is_complete()) {
            if !exist_ok {
                return Err(StateError::AlreadyMarshalled {
                    stage: "export".into(),
                }
                .into());
            }
            return Ok(self.export_marshalled);
        }

        if self.marshall_stage(exist_ok, false).await?.is_none() {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::EXPORT_STATE_FILE);
        let already = tokio::fs::try_exists(&path).await.unwrap_or(false);

        if !already || overwrite {
            debug!(?path, "creating marshalled export results file");
            let rendered = serde_yaml::to_string(&self.run_export_actions)
                .context("serialize export results")?;
            fs::atomic_write(&path, rendered.as_bytes()).await?;
        }

        self.export_marshalled = Some(file_mark(&path).await?);
        Ok(self.export_marshalled)
    }

    /// Replay the export record.
    #[instrument(skip(self))]
    pub async fn unmarshall_export(
        &mut self,
        offline: bool,
        fail_ok: bool,
    ) -> Result<Option<StageMark>> {
        if self.export_marshalled.is_some() {
            return Ok(self.export_marshalled);
        }

        let stage_mark = self.unmarshall_stage(offline, fail_ok).await?;
        if stage_mark.is_none_or(|mark| !mark.is_complete()) {
            return Ok(None);
        }

        let layout = self.layout()?;
        let path = layout.meta_file(workdir::EXPORT_STATE_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            // Not yet exported: that is a normal state, not damage, for
            // status queries; recorded as damaged only when required.
            self.export_marshalled = Some(StageMark::damaged());
            if fail_ok {
                return Ok(self.export_marshalled);
            }
            return Err(StateError::MissingPrerequisite {
                operation: "replay export state".into(),
                prerequisite: "export".into(),
            }
            .into());
        }

        let outcome: Result<()> = async {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read {path:?}"))?;
            self.run_export_actions =
                serde_yaml::from_str(&raw).with_context(|| format!("unmarshal {path:?}"))?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.export_marshalled = Some(file_mark(&path).await?);
                Ok(self.export_marshalled)
            }
            Err(err) => {
                self.export_marshalled = Some(StageMark::damaged());
                if fail_ok {
                    warn!("unmarshalling export state failed: {err:#}");
                    Ok(self.export_marshalled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// The previously recorded export actions.
    pub async fn list_materialized_export_actions(
        &mut self,
    ) -> Result<&[MaterializedExportAction]> {
        self.unmarshall_export(true, false).await?;
        Ok(&self.run_export_actions)
    }

    // --- crate emitter accessors ----------------------------------------

    pub(crate) fn crate_view(&self) -> Result<rocrate::CrateView<'_>> {
        let layout = self.layout()?;
        Ok(rocrate::CrateView {
            instance_id: &self.instance_id,
            nickname: &self.nickname,
            layout,
            local_workflow: self.local_workflow.as_ref(),
            materialized_engine: self.materialized_engine.as_ref(),
            workflow_engine_version: self.workflow_engine_version.as_deref(),
            container_engine_version: self.container_engine_version.as_deref(),
            materialized_params: self.materialized_params.as_deref().unwrap_or_default(),
            expected_outputs: &self.expected_outputs,
            matched_outputs: self.matched_outputs.as_deref().unwrap_or_default(),
            exit_val: self.exit_val,
            execution_started: self.execution_started,
            execution_ended: self.execution_ended,
            stage_mark: self.stage_marshalled,
            execution_mark: self.execution_marshalled,
        })
    }
}

/// The authoritative "completed at" timestamp of a marshalled file is its
/// mtime.
async fn file_mark(path: &Path) -> Result<StageMark> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {path:?}"))?;
    let mtime = meta.modified().context("read mtime")?;
    let timestamp = Timestamp::try_from(mtime).context("convert mtime")?;
    Ok(StageMark::At(timestamp))
}
