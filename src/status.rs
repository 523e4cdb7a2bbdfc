//! Job status pages: one JSON blob for machines, one HTML blob for
//! humans, republished as the job makes progress. Pages start under
//! `active::` and are renamed to `done::` when the job is torn down.

use anyhow::{Context, Result};
use serde::Serialize;
use tinytemplate::TinyTemplate;
use tracing::info;

use crate::naming::status_page_name;
use crate::store::Store;

/// The JSON page contract. Field names are the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub backend: String,
    pub job_name: String,
    pub cache_key: String,
    pub max_simultaneous_tasks: usize,
    pub num_tasks: Option<usize>,
    pub start_time: String,
    pub submitted_tasks: Vec<String>,
    pub completed_tasks: Vec<String>,
    pub running_tasks: Vec<String>,
    pub reused_tasks: Vec<String>,
}

#[derive(Serialize)]
struct HtmlContext {
    job_name: String,
    cache_key: String,
    backend: String,
    max_simultaneous_tasks: usize,
    start_time: String,
    status_time: String,
    percent_complete: String,
    num_running_tasks: usize,
    num_completed_tasks: usize,
    num_submitted_tasks: usize,
    num_reused_tasks: usize,
    num_tasks: String,
}

const HTML_TEMPLATE: &str = r#"<html>
<head><title>fanout status: {job_name}</title></head>
<body>
<h1>fanout</h1>
<h2>{job_name}</h2>
<table>
<tr><td>Job</td><td>{job_name}</td></tr>
<tr><td>Cache key</td><td>{cache_key}</td></tr>
<tr><td>Backend</td><td>{backend}</td></tr>
<tr><td>Max simultaneous tasks</td><td>{max_simultaneous_tasks}</td></tr>
<tr><td>Start time</td><td>{start_time}</td></tr>
<tr><td>Status time</td><td>{status_time}</td></tr>
</table>
<h2>Status</h2>
<table>
<tr><td>Percent complete</td><td>{percent_complete}</td></tr>
<tr><td>Running tasks</td><td>{num_running_tasks}</td></tr>
<tr><td>Completed tasks</td><td>{num_completed_tasks}</td></tr>
<tr><td>Submitted tasks</td><td>{num_submitted_tasks}</td></tr>
<tr><td>Reused tasks</td><td>{num_reused_tasks}</td></tr>
<tr><td>Total tasks</td><td>{num_tasks}</td></tr>
</table>
</body>
</html>
"#;

pub fn render_html(snapshot: &StatusSnapshot) -> Result<String> {
    let percent_complete = match snapshot.num_tasks {
        Some(total) if total > 0 => {
            format!("{:.1}", snapshot.completed_tasks.len() as f64 * 100.0 / total as f64)
        }
        _ => "unknown".to_string(),
    };
    let ctx = HtmlContext {
        job_name: snapshot.job_name.clone(),
        cache_key: snapshot.cache_key.clone(),
        backend: snapshot.backend.clone(),
        max_simultaneous_tasks: snapshot.max_simultaneous_tasks,
        start_time: snapshot.start_time.clone(),
        status_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        percent_complete,
        num_running_tasks: snapshot.running_tasks.len(),
        num_completed_tasks: snapshot.completed_tasks.len(),
        num_submitted_tasks: snapshot.submitted_tasks.len(),
        num_reused_tasks: snapshot.reused_tasks.len(),
        num_tasks: snapshot
            .num_tasks
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };
    let mut tt = TinyTemplate::new();
    tt.add_template("status", HTML_TEMPLATE)?;
    let html = tt.render("status", &ctx)?;
    Ok(html)
}

#[derive(Debug, Clone)]
pub struct StatusWriter {
    store: Store,
    json_name: String,
    html_name: String,
}

impl StatusWriter {
    pub fn new(store: Store, job_name: &str) -> Result<Self> {
        Ok(StatusWriter {
            json_name: status_page_name(job_name, "json", "active")?,
            html_name: status_page_name(job_name, "html", "active")?,
            store,
        })
    }

    pub fn print_info(&self) {
        info!("job status available at:");
        info!("\t{}", self.store.access_info(&self.json_name));
        info!("\t{}", self.store.access_info(&self.html_name));
    }

    pub async fn update(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot).context("serializing status page")?;
        self.store
            .put(&self.json_name, json.into(), Some("application/json"))
            .await?;
        let html = render_html(snapshot)?;
        self.store
            .put(&self.html_name, html.into_bytes().into(), Some("text/html"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            backend: "in-process".to_string(),
            job_name: "key-000::abcd1234".to_string(),
            cache_key: "key-000".to_string(),
            max_simultaneous_tasks: 10,
            num_tasks: Some(4),
            start_time: "2024-01-01 00:00:00".to_string(),
            submitted_tasks: vec!["key-000::0".into(), "key-000::1".into()],
            completed_tasks: vec!["key-000::0".into()],
            running_tasks: vec!["key-000::1".into()],
            reused_tasks: vec![],
        }
    }

    #[test]
    fn test_json_contract_keys() {
        let value = serde_json::to_value(snapshot()).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "backend",
            "job_name",
            "cache_key",
            "max_simultaneous_tasks",
            "num_tasks",
            "start_time",
            "submitted_tasks",
            "completed_tasks",
            "running_tasks",
            "reused_tasks",
        ] {
            assert!(object.contains_key(key), "missing key {}", key);
        }
        assert_eq!(object.len(), 10);
    }

    #[test]
    fn test_render_html() {
        let html = render_html(&snapshot()).unwrap();
        assert!(html.contains("key-000::abcd1234"));
        assert!(html.contains("<td>Percent complete</td><td>25.0</td>"));

        let mut unknown = snapshot();
        unknown.num_tasks = None;
        let html = render_html(&unknown).unwrap();
        assert!(html.contains("<td>Total tasks</td><td>unknown</td>"));
    }

    #[tokio::test]
    async fn test_update_writes_both_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_url(dir.path().to_str().unwrap()).unwrap();
        let writer = StatusWriter::new(store.clone(), "key-000::abcd1234").unwrap();
        writer.print_info();
        writer.update(&snapshot()).await.unwrap();

        assert_eq!(
            store.list("active::").await.unwrap(),
            vec![
                "active::html::key-000::abcd1234.html",
                "active::json::key-000::abcd1234.json"
            ]
        );
    }
}
