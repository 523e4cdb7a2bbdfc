//! `fanout copy`: move one blob between stores. Workers inside
//! containers use this to stage files; people use it to peek at
//! inputs and results.

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::store::Store;

#[derive(Debug, Args)]
pub struct CopyArgs {
    /// Source blob: a local path or a bucket URL.
    pub source: String,

    /// Destination blob, or `-` for stdout.
    pub destination: String,

    /// Exit quietly when the source does not exist.
    #[arg(long)]
    pub no_error: bool,
}

/// Split a full blob path into its store root and blob name.
fn split(path: &str) -> Result<(Store, String)> {
    let (root, name) = path
        .rsplit_once('/')
        .with_context(|| format!("no blob name in path: {}", path))?;
    anyhow::ensure!(
        !name.is_empty() && !root.is_empty() && !root.ends_with(':'),
        "cannot split {} into store root and blob name",
        path
    );
    let store = Store::from_url(root)?;
    Ok((store, name.to_string()))
}

pub async fn run(args: CopyArgs) -> Result<()> {
    let (source_store, source_name) = split(&args.source)?;
    info!("reading: {}", args.source);
    let bytes = match source_store.get(&source_name).await {
        Ok(bytes) => bytes,
        Err(err) if args.no_error => {
            warn!("ignoring missing source {}: {:#}", args.source, err);
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if args.destination == "-" {
        use std::io::Write;
        std::io::stdout().write_all(&bytes)?;
        return Ok(());
    }

    let (dest_store, dest_name) = split(&args.destination)?;
    info!("writing: {}", args.destination);
    dest_store.put(&dest_name, bytes, None).await?;
    info!("completed");
    Ok(())
}
