use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use stagehand::instance::{Backend, WorkflowInstance};
use stagehand::types::StageMark;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The staged instance: an id under the home directory, or a path to a
    /// raw working directory.
    instance: String,
}

fn render(mark: Option<StageMark>) -> String {
    match mark {
        None => "absent".to_string(),
        Some(StageMark::Damaged(_)) => "damaged".to_string(),
        Some(StageMark::At(at)) => at.to_string(),
    }
}

#[instrument(skip(backend))]
pub async fn exec(backend: Arc<Backend>, options: Options) -> Result<()> {
    let raw_dir = super::resolve_instance_dir(&backend, &options.instance)?;
    let instance = WorkflowInstance::from_work_dir(backend, &raw_dir, true).await?;

    let status = instance.marshalling_status();
    println!("instance:  {}", instance.instance_id());
    println!("nickname:  {}", instance.nickname());
    println!("created:   {}", instance.creation());
    println!("damaged:   {}", instance.is_damaged());
    println!("config:    {}", render(status.config));
    println!("stage:     {}", render(status.stage));
    println!("execution: {}", render(status.execution));
    println!("export:    {}", render(status.export));

    instance.cleanup().await
}
