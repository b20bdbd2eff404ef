//! The binary entrypoint for `stagehand`, the reproducible workflow
//! enactment backend.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use tracing_subscriber::util::SubscriberInitExt;

use stagehand::instance::Backend;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "stagehand",
    about = "Reproducible workflow staging and enactment",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Home directory holding the caches and the staged instances.
    #[arg(long, env = "STAGEHAND_HOME", default_value = ".stagehand")]
    home: PathBuf,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Create a staged working directory for a workflow
    Stage(cmd::stage::Options),

    /// Execute a previously staged instance
    Execute(cmd::execute::Options),

    /// Run export actions of a staged or executed instance
    Export(cmd::export::Options),

    /// Show the marshalling status of an instance
    Status(cmd::status::Options),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    log::make_logger(std::io::stderr, top.color)?.init();

    let backend = Arc::new(Backend::new(&top.home));
    match top.command {
        Command::Stage(options) => cmd::stage::exec(backend, options).await,
        Command::Execute(options) => cmd::execute::exec(backend, options).await,
        Command::Export(options) => cmd::export::exec(backend, options).await,
        Command::Status(options) => cmd::status::exec(backend, options).await,
    }
}
