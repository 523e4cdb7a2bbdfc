//! Runs workers as tokio tasks inside the driver process. The blob
//! protocol is identical to the remote backends, which makes this the
//! backend of choice for tests and single-machine runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error};

use crate::store::Store;
use crate::task::TaskRegistry;
use crate::worker;

#[derive(Debug, Clone)]
pub struct InProcessBackend {
    store: Store,
    registry: Arc<TaskRegistry>,
    delete_input: bool,
    submissions: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
}

impl InProcessBackend {
    pub fn new(store: Store, registry: Arc<TaskRegistry>, delete_input: bool) -> Self {
        InProcessBackend {
            store,
            registry,
            delete_input,
            submissions: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total task attempts handed to this backend.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently running workers.
    pub fn peak_simultaneous(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub async fn submit_task(
        &self,
        task_name: &str,
        input_name: &str,
        result_template: &str,
    ) -> Result<()> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        debug!("spawning in-process worker for task '{}'", task_name);

        let store = self.store.clone();
        let registry = self.registry.clone();
        let delete_input = self.delete_input;
        let running = self.running.clone();
        let peak_running = self.peak_running.clone();
        let task_name = task_name.to_string();
        let input_name = input_name.to_string();
        let result_template = result_template.to_string();

        tokio::spawn(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak_running.fetch_max(now, Ordering::SeqCst);
            let outcome =
                worker::run_task(&store, &registry, &input_name, &result_template, delete_input)
                    .await;
            running.fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = outcome {
                // The driver never learns about this directly; the task
                // simply produces no result blob.
                error!("in-process worker for '{}' failed: {:?}", task_name, err);
            }
        });
        Ok(())
    }
}
