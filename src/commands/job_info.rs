//! `fanout job-info`: list status pages grouped by cache key.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use crate::client::{Client, ClientArgs};
use crate::task::TaskRegistry;

#[derive(Debug, Args)]
pub struct JobInfoArgs {
    /// Restrict to these job names.
    pub jobs: Vec<String>,

    #[arg(long)]
    pub include_done: bool,

    /// Delete the listed jobs' input and result blobs.
    #[arg(long)]
    pub cleanup: bool,

    #[command(flatten)]
    pub client: ClientArgs,
}

pub async fn run(args: JobInfoArgs, registry: Arc<TaskRegistry>) -> Result<()> {
    let client = Client::from_args(&args.client, registry)?;
    let job_names = if args.jobs.is_empty() {
        None
    } else {
        Some(args.jobs.as_slice())
    };
    let summary = client.job_summary(job_names, args.include_done).await?;
    if summary.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    let mut by_cache_key: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for page in &summary {
        let cache_key = page
            .cache_key()
            .unwrap_or_else(|_| "(unparsable)".to_string());
        by_cache_key
            .entry(cache_key)
            .or_default()
            .push((page.status.clone(), page.job_name.clone()));
    }

    for (cache_key, jobs) in &by_cache_key {
        println!("Cache key: {}", cache_key);
        for (status, job_name) in jobs {
            println!("\t{:>7} : {}", status, job_name);
        }
        println!();
    }

    if args.cleanup {
        for page in &summary {
            client.cleanup_job(&page.job_name).await?;
        }
    }
    Ok(())
}
