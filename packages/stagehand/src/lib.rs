//! Library for `stagehand`, a reproducible workflow enactment backend.
//!
//! The core takes a workflow reference (a canonical repository URL or a
//! GA4GH TRSv2 tool/version/descriptor triple), materializes it together
//! with its inputs and container images into an instance-scoped, optionally
//! encrypted staging directory, executes it through a pluggable
//! workflow-engine adapter, and persists the whole enactment as marshalled
//! state files plus RO-Crate archives.
//!
//! Engine adapters, container runtimes and export plugins are external
//! collaborators: they implement the traits in [`engine`], [`container`]
//! and [`export`] and register with the [`instance::Backend`].

pub mod cache;
pub mod config;
pub mod container;
pub mod digest;
pub mod engine;
pub mod error;
pub mod export;
pub mod fetch;
pub mod fs;
pub mod instance;
pub mod outputs;
pub mod process;
pub mod resolver;
pub mod rocrate;
pub mod stager;
pub mod types;
pub mod workdir;
