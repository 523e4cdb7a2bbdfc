//! `fanout map`: run a shell command template over items, one worker
//! per task, and print item/output pairs.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{json, Value};
use tracing::info;

use crate::client::{Client, ClientArgs, MapOptions};
use crate::task::TaskRegistry;

#[derive(Debug, Args)]
pub struct MapArgs {
    /// Shell command template; `{}` is replaced with each item.
    #[arg(long)]
    pub shell_command: String,

    /// Items as JSON values (bare words become strings). Read from
    /// stdin, one per line, when absent.
    #[arg(long, num_args = 0..)]
    pub items: Vec<String>,

    #[arg(long, default_value_t = 1)]
    pub items_per_task: usize,

    #[command(flatten)]
    pub client: ClientArgs,
}

fn parse_item(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn read_stdin_items() -> Result<Vec<Value>> {
    let stdin = std::io::stdin();
    let mut items = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("reading items from stdin")?;
        if !line.trim().is_empty() {
            items.push(parse_item(line.trim()));
        }
    }
    Ok(items)
}

pub async fn run(args: MapArgs, registry: Arc<TaskRegistry>) -> Result<()> {
    let items: Vec<Value> = if args.items.is_empty() {
        read_stdin_items()?
    } else {
        args.items.iter().map(|raw| parse_item(raw)).collect()
    };
    info!("mapping '{}' over {} items", args.shell_command, items.len());

    let num_items = items.len();
    let command = args.shell_command.clone();
    let wrapped = items
        .into_iter()
        .map(move |value| json!({ "command": command, "value": value }));

    let mut client = Client::from_args(&args.client, registry)?;
    let mut results = client
        .map(
            "shell-command",
            wrapped.collect::<Vec<Value>>(),
            MapOptions {
                items_per_task: args.items_per_task,
                num_items: Some(num_items),
                cache_key: None,
            },
        )
        .await?;

    println!("value\toutput");
    while let Some(item) = results.next().await {
        let item = item?;
        let output = item["output"].as_str().unwrap_or_default();
        println!("{}\t{}", item["value"], output.trim_end());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item() {
        assert_eq!(parse_item("3"), json!(3));
        assert_eq!(parse_item("\"x\""), json!("x"));
        assert_eq!(parse_item("plain words"), json!("plain words"));
    }
}
