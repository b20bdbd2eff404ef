use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::{Result, eyre::Context};
use tracing::instrument;

use stagehand::config;
use stagehand::export::parse_export_actions;
use stagehand::instance::{Backend, WorkflowInstance};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The staged instance: an id under the home directory, or a path to a
    /// raw working directory.
    instance: String,

    /// Export actions file; without it the staging definition's default
    /// actions run.
    #[arg(short = 'E', long = "export-actions")]
    export_actions: Option<PathBuf>,

    /// Credentials file with the named security contexts. Credentials are
    /// never persisted, so they must be supplied at export time.
    #[arg(short = 'Z', long = "security-contexts")]
    security_contexts: Option<PathBuf>,

    /// Only run the actions with these ids.
    #[arg(long = "action")]
    action_ids: Vec<String>,

    /// Report failed actions instead of failing the command.
    #[arg(long)]
    fail_ok: bool,
}

#[instrument(skip(backend))]
pub async fn exec(backend: Arc<Backend>, options: Options) -> Result<()> {
    let raw_dir = super::resolve_instance_dir(&backend, &options.instance)?;
    let mut instance = WorkflowInstance::from_work_dir(backend, &raw_dir, false).await?;

    let actions = match &options.export_actions {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read export actions {path:?}"))?;
            let document: serde_yaml::Value =
                serde_yaml::from_str(&raw).context("parse export actions YAML")?;
            let exports = document
                .get("exports")
                .cloned()
                .unwrap_or(serde_yaml::Value::Sequence(Vec::new()));
            Some(parse_export_actions(&exports)?)
        }
        None => None,
    };

    let credentials = match &options.security_contexts {
        Some(path) => Some(config::load_security_contexts(path).await?),
        None => None,
    };

    let result = instance
        .export_results(
            actions,
            credentials.as_ref(),
            &options.action_ids,
            options.fail_ok,
        )
        .await;

    if let Ok((materialized, errors)) = &result {
        for action in materialized {
            for pid in &action.pids {
                println!("{}: {}", action.action.action_id, pid.pid);
            }
        }
        for (action, err) in errors {
            eprintln!("{}: FAILED: {err:#}", action.action_id);
        }
    }
    instance.cleanup().await?;

    result.map(|_| ())
}
