use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use stagehand::instance::{Backend, WorkflowInstance};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The staged instance: an id under the home directory, or a path to a
    /// raw working directory.
    instance: String,

    /// Do not touch the network; everything must already be staged.
    #[arg(long)]
    offline: bool,
}

#[instrument(skip(backend))]
pub async fn exec(backend: Arc<Backend>, options: Options) -> Result<()> {
    let raw_dir = super::resolve_instance_dir(&backend, &options.instance)?;
    let mut instance = WorkflowInstance::from_work_dir(backend, &raw_dir, false).await?;

    let result = instance.execute_workflow(options.offline).await;
    if let Ok(exit_val) = &result {
        println!("workflow exited with {exit_val}");
    }
    instance.cleanup().await?;

    result.map(|_| ())
}
