//! `fanout run-task`: the worker entry point. Backends launch this in
//! a subprocess, container, or pod; it reads the input blob, runs the
//! task, and publishes the result blob.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::store::Store;
use crate::task::TaskRegistry;
use crate::worker;

#[derive(Debug, Args)]
pub struct RunTaskArgs {
    pub input_name: String,

    /// Result-blob template with `{result_type}` and `{result_time}`
    /// left for this process to fill in.
    pub result_template: String,

    #[arg(long, env = "FANOUT_STORAGE")]
    pub storage: String,

    /// Delete the input blob after a successful run.
    #[arg(long)]
    pub delete_input: bool,
}

pub async fn run(args: RunTaskArgs, registry: Arc<TaskRegistry>) -> Result<()> {
    let store = Store::from_url(&args.storage)?;
    let result_name = worker::run_task(
        &store,
        &registry,
        &args.input_name,
        &args.result_template,
        args.delete_input,
    )
    .await?;
    info!("done: {}", result_name);
    Ok(())
}
