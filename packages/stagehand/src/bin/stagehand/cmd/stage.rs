use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use stagehand::instance::{Backend, WorkflowInstance};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The workflow staging definition (workflow_meta.yaml).
    #[arg(short = 'W', long = "workflow-meta")]
    workflow_meta: PathBuf,

    /// Credentials file with the named security contexts.
    #[arg(short = 'Z', long = "security-contexts")]
    security_contexts: Option<PathBuf>,

    /// Prefix for the instance nickname.
    #[arg(long)]
    nickname_prefix: Option<String>,

    /// Extra local paths to stage into the inputs directory, beyond what
    /// the staging definition declares. May be repeated.
    #[arg(long = "inject")]
    inject: Vec<PathBuf>,

    /// Never touch the shared caches; re-download everything into the
    /// instance.
    #[arg(long)]
    paranoid: bool,

    /// Do not touch the network; fail on anything not already cached.
    #[arg(long)]
    offline: bool,
}

#[instrument(skip(backend))]
pub async fn exec(backend: Arc<Backend>, options: Options) -> Result<()> {
    let mut instance = WorkflowInstance::from_files(
        backend,
        &options.workflow_meta,
        options.security_contexts.as_deref(),
        options.nickname_prefix.as_deref(),
        options.paranoid,
    )
    .await?;

    let result = async {
        let mark = instance.stage_work_dir(options.offline).await?;
        if !options.inject.is_empty() {
            let injected = instance
                .inject_inputs(&options.inject, options.offline)
                .await?;
            println!("injected {} extra input(s)", injected.len());
        }
        Ok::<_, color_eyre::Report>(mark)
    }
    .await;

    match &result {
        Ok(mark) => {
            println!(
                "staged instance {} ({}) at {}",
                instance.instance_id(),
                instance.nickname(),
                instance.raw_dir().display()
            );
            if let Some(at) = mark.timestamp() {
                println!("stage marshalled at {at}");
            }
        }
        Err(_) => {}
    }
    instance.cleanup().await?;
    result.map(|_| ())
}
