//! Integration tests for the enactment core.
//!
//! The concrete engines, container runtimes and export plugins are external
//! collaborators, so the suite drives the core through in-tree stubs: a
//! workflow engine that recognizes `main.cwl` files and writes a result
//! file on launch, and an export plugin that mints fake pids.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use jiff::Timestamp;

use stagehand::container::NoContainerFactory;
use stagehand::engine::{
    EngineProvider, EngineScope, MaterializedEngine, WorkflowEngine,
};
use stagehand::export::{ExportPlugin, ExportPluginProvider};
use stagehand::instance::Backend;
use stagehand::outputs;
use stagehand::types::{
    ContainerKind, EngineKind, ExitVal, ExpectedOutput, ExportElem, ExportedPid, LocalWorkflow,
    MaterializedInput, SecurityContext, StagedExecution,
};

pub mod cache;
pub mod lifecycle;
pub mod resolver;
pub mod stager;
pub mod workdir;

/// A workflow engine stub: recognizes a `main.cwl` entry file, and on
/// launch writes `result.txt` into the outputs directory.
#[derive(Clone)]
pub struct StubEngine {
    scope: EngineScope,
}

#[async_trait]
impl WorkflowEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cwl
    }

    fn supported_container_types(&self) -> &[ContainerKind] {
        &[ContainerKind::NoContainer]
    }

    fn supported_secure_container_types(&self) -> &[ContainerKind] {
        &[ContainerKind::NoContainer]
    }

    fn has_explicit_outputs(&self) -> bool {
        false
    }

    async fn identify(
        &self,
        workflow: &LocalWorkflow,
        _desired_engine_version: Option<&str>,
    ) -> Result<Option<(String, LocalWorkflow)>> {
        let entry = match &workflow.rel_path {
            Some(rel) => workflow.dir.join(rel),
            None => workflow.dir.join("main.cwl"),
        };
        if !entry.is_file() {
            return Ok(None);
        }
        let mut refined = workflow.clone();
        if refined.rel_path.is_none() {
            refined.rel_path = Some("main.cwl".to_string());
        }
        refined.lang_version = Some("v1.2".to_string());
        Ok(Some(("1.0.0".to_string(), refined)))
    }

    async fn materialize_engine(
        &self,
        workflow: &LocalWorkflow,
        engine_version: Option<&str>,
    ) -> Result<Option<MaterializedEngine>> {
        let version = engine_version.unwrap_or("1.0.0").to_string();
        let engine_path = self.scope.cache_dir.join("engines/stub-cwl");
        tokio::fs::create_dir_all(&engine_path).await?;
        Ok(Some(MaterializedEngine {
            instance: Arc::new(self.clone()),
            kind: EngineKind::Cwl,
            fingerprint: format!("stub-cwl-{version}"),
            version,
            engine_path,
            workflow: workflow.clone(),
            containers_path: None,
            containers: None,
            operational_containers: None,
        }))
    }

    async fn materialize_workflow(
        &self,
        engine: MaterializedEngine,
        consolidated_dir: &Path,
        _offline: bool,
    ) -> Result<(MaterializedEngine, Vec<String>)> {
        tokio::fs::create_dir_all(consolidated_dir).await?;
        let entry = engine.workflow.entrypoint();
        if entry.is_file() {
            let target = consolidated_dir.join("main.cwl");
            tokio::fs::copy(&entry, &target).await?;
        }
        Ok((engine, Vec::new()))
    }

    async fn launch(
        &self,
        _engine: &MaterializedEngine,
        inputs: &[MaterializedInput],
        _environment: &[MaterializedInput],
        expected_outputs: &[ExpectedOutput],
    ) -> Result<StagedExecution> {
        let started = Timestamp::now();
        let outputs_dir = &self.scope.layout.outputs_dir;
        tokio::fs::write(outputs_dir.join("result.txt"), b"enactment finished\n").await?;

        let matched_outputs = outputs::identify_materialized_outputs(
            inputs,
            expected_outputs,
            outputs_dir,
            None,
            false,
        )
        .await?;

        Ok(StagedExecution {
            exit_val: ExitVal(0),
            started,
            ended: Timestamp::now(),
            augmented_inputs: inputs.to_vec(),
            matched_outputs,
            log_files: Vec::new(),
        })
    }
}

pub struct StubEngineProvider;

impl EngineProvider for StubEngineProvider {
    fn kind(&self) -> EngineKind {
        EngineKind::Cwl
    }

    fn instantiate(&self, scope: &EngineScope) -> Result<Arc<dyn WorkflowEngine>> {
        Ok(Arc::new(StubEngine {
            scope: scope.clone(),
        }))
    }
}

/// An export plugin stub minting `fake:` pids, one per push.
pub struct StubExportPlugin {
    require_token: bool,
    token: Option<String>,
}

#[async_trait]
impl ExportPlugin for StubExportPlugin {
    fn plugin_id(&self) -> &str {
        "stub-repository"
    }

    async fn push(
        &self,
        items: &[ExportElem],
        preferred_scheme: Option<&str>,
        preferred_id: Option<&str>,
    ) -> Result<Vec<ExportedPid>> {
        if self.require_token && self.token.is_none() {
            color_eyre::eyre::bail!("no token supplied");
        }
        let scheme = preferred_scheme.unwrap_or("fake");
        let id = preferred_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-items", items.len()));
        Ok(vec![ExportedPid {
            pid: format!("{scheme}:{id}"),
            metadata: Vec::new(),
        }])
    }
}

pub struct StubExportProvider {
    pub require_token: bool,
}

impl ExportPluginProvider for StubExportProvider {
    fn plugin_id(&self) -> &str {
        "stub-repository"
    }

    fn instantiate(&self, setup: Option<&SecurityContext>) -> Result<Arc<dyn ExportPlugin>> {
        let token = setup
            .and_then(|context| context.get("token"))
            .and_then(|value| value.as_str())
            .map(str::to_string);
        Ok(Arc::new(StubExportPlugin {
            require_token: self.require_token,
            token,
        }))
    }
}

/// A backend rooted in a temporary home, with the stub engine and export
/// plugin registered.
pub fn test_backend(home: &Path) -> Arc<Backend> {
    let mut backend = Backend::new(home);
    backend.engines.register(Arc::new(StubEngineProvider));
    backend
        .container_factories
        .register(Arc::new(NoContainerFactory));
    backend
        .export_plugins
        .register(Arc::new(StubExportProvider {
            require_token: true,
        }));
    Arc::new(backend)
}

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args([
            "-c",
            "user.email=tests@example.org",
            "-c",
            "user.name=tests",
        ])
        .args(args)
        .status()
        .unwrap_or_else(|err| panic!("run git {args:?}: {err}"));
    assert!(status.success(), "git {args:?} failed");
}

/// Create a local git repository holding a `main.cwl`, tagged `v1`.
/// Returns the repo path and the commit the tag points at.
pub fn git_workflow_fixture(dir: &Path) -> (PathBuf, String) {
    let repo = dir.join("workflow-repo");
    std::fs::create_dir_all(&repo).expect("create fixture repo dir");

    let status = Command::new("git")
        .args(["init", "-q", "-b", "main"])
        .arg(&repo)
        .status()
        .expect("run git init");
    assert!(status.success(), "git init failed");

    std::fs::write(
        repo.join("main.cwl"),
        "cwlVersion: v1.2\nclass: CommandLineTool\nbaseCommand: true\n",
    )
    .expect("write workflow file");
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "initial workflow"]);
    git(&repo, &["tag", "v1"]);

    let output = Command::new("git")
        .arg("-C")
        .arg(&repo)
        .args(["rev-parse", "v1"])
        .output()
        .expect("run git rev-parse");
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();

    (repo, commit)
}

/// A minimal staging definition against a local git fixture, with the
/// encrypted overlay disabled so the suite does not need FUSE.
pub fn staging_definition(repo: &Path) -> String {
    format!(
        r#"workflow_id: "git+file://{repo}#v1"
nickname: it-run
workflow_config:
  secure: false
params:
  threads: 2
outputs:
  result:
    c-l-a-s-s: File
    glob: "*.txt"
    cardinality: "+"
default_actions:
  - id: a1
    plugin: stub-repository
    what: ["output:result"]
    security-context: repo1
"#,
        repo = repo.display()
    )
}
