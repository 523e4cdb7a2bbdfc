//! The `fanout` binary: thin adapters over the client library.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::task::TaskRegistry;

pub mod copy;
pub mod job_info;
pub mod map;
pub mod run_task;

#[derive(Debug, Parser)]
#[command(
    name = "fanout",
    version,
    about = "Distributed map over iterables through a shared blob store"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a shell command over a list of items on the configured
    /// backend.
    Map(map::MapArgs),
    /// Show (and optionally clean up) job status pages.
    JobInfo(job_info::JobInfoArgs),
    /// Copy a blob between stores.
    Copy(copy::CopyArgs),
    /// Worker entry point; invoked by backends, not by people.
    #[command(hide = true)]
    RunTask(run_task::RunTaskArgs),
}

impl Cli {
    /// Dispatch with the given task registry. User binaries that embed
    /// fanout call this with their own registry so workers can resolve
    /// their functions.
    pub async fn run(self, registry: TaskRegistry) -> Result<()> {
        let registry = Arc::new(registry);
        match self.command {
            Command::Map(args) => map::run(args, registry).await,
            Command::JobInfo(args) => job_info::run(args, registry).await,
            Command::Copy(args) => copy::run(args).await,
            Command::RunTask(args) => run_task::run(args, registry).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_task() {
        let cli = Cli::try_parse_from([
            "fanout",
            "run-task",
            "input::key-000::0",
            "result::key-000::0::0::1::{result_type}::{result_time}",
            "--storage",
            "/tmp/fanout",
        ])
        .unwrap();
        match cli.command {
            Command::RunTask(args) => {
                assert_eq!(args.input_name, "input::key-000::0");
                assert_eq!(args.storage, "/tmp/fanout");
                assert!(!args.delete_input);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["fanout"]).is_err());
    }
}
