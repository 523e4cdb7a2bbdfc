//! The dispatcher for one logical map operation: admission-controlled
//! submission, completion polling against the blob store, speculative
//! re-execution of stragglers, and in-order result streaming.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::common::{epoch_seconds, epoch_seconds_int, human_readable_size, truncate};
use crate::naming::{self, TaskResultName};
use crate::result::{ResultEnvelope, ResultType};
use crate::status::{StatusSnapshot, StatusWriter};
use crate::store::Store;
use crate::task::Task;

#[derive(Debug, Clone, Copy)]
pub struct SpeculationPolicy {
    /// Speculation stays off until the running fraction of submitted
    /// tasks drops to this percentage.
    pub percent: f64,
    /// Percentile of observed task elapsed times used as the rerun
    /// threshold.
    pub runtime_percentile: f64,
    /// Upper bound on attempts per task.
    pub max_reruns: usize,
}

impl Default for SpeculationPolicy {
    fn default() -> Self {
        SpeculationPolicy {
            percent: 20.0,
            runtime_percentile: 99.0,
            max_reruns: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub cache_key: String,
    pub max_simultaneous_tasks: usize,
    pub num_tasks: Option<usize>,
    pub wait_to_raise_task_exception: bool,
    pub speculation: SpeculationPolicy,
}

#[derive(Debug, Clone)]
struct CompletedTask {
    blob_name: String,
    parsed: TaskResultName,
}

pub struct Job {
    backend: Backend,
    backend_description: String,
    store: Store,
    tasks: Box<dyn Iterator<Item = Task> + Send>,
    config: JobConfig,
    job_name: String,
    start_time: String,
    submitted_tasks: Vec<String>,
    reused_tasks: HashSet<String>,
    completed_tasks: HashMap<String, CompletedTask>,
    task_attempts: HashMap<String, Vec<u64>>,
    status_writer: StatusWriter,
}

impl Job {
    pub async fn new(
        backend: Backend,
        store: Store,
        tasks: Box<dyn Iterator<Item = Task> + Send>,
        config: JobConfig,
    ) -> Result<Job> {
        let job_name = naming::make_job_name(&config.cache_key)?;
        let status_writer = StatusWriter::new(store.clone(), &job_name)?;
        status_writer.print_info();

        let job = Job {
            backend_description: backend.describe(),
            backend,
            store,
            tasks,
            job_name: job_name.clone(),
            start_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            submitted_tasks: Vec::new(),
            reused_tasks: HashSet::new(),
            completed_tasks: HashMap::new(),
            task_attempts: HashMap::new(),
            status_writer,
            config,
        };
        info!(
            "created job {} with cache key {}",
            job_name, job.config.cache_key
        );
        job.status_writer.update(&job.snapshot()).await?;
        Ok(job)
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn cache_key(&self) -> &str {
        &self.config.cache_key
    }

    /// Derived, never authoritative: submitted minus completed, in
    /// submission order.
    fn running_tasks(&self) -> Vec<String> {
        self.submitted_tasks
            .iter()
            .filter(|t| !self.completed_tasks.contains_key(*t))
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> StatusSnapshot {
        let mut completed: Vec<String> = self.completed_tasks.keys().cloned().collect();
        completed.sort();
        let mut reused: Vec<String> = self.reused_tasks.iter().cloned().collect();
        reused.sort();
        StatusSnapshot {
            backend: self.backend_description.clone(),
            job_name: self.job_name.clone(),
            cache_key: self.config.cache_key.clone(),
            max_simultaneous_tasks: self.config.max_simultaneous_tasks,
            num_tasks: self.config.num_tasks,
            start_time: self.start_time.clone(),
            submitted_tasks: self.submitted_tasks.clone(),
            completed_tasks: completed,
            running_tasks: self.running_tasks(),
            reused_tasks: reused,
        }
    }

    /// Scan the result prefix for new completions.
    ///
    /// The first scan runs with nothing submitted, so it lists the whole
    /// cache-key prefix and primes `completed_tasks` with results left
    /// by earlier runs — that is the cache-reuse mechanism.
    async fn update(&mut self) -> Result<()> {
        let running = self.running_tasks();
        let prefix =
            naming::task_result_prefix(&self.config.cache_key, running.iter().map(|s| s.as_str()));
        let names = self.store.list(&prefix).await?;
        for name in names {
            let parsed = match TaskResultName::parse(&name) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("skipping unrecognized result blob {}: {:#}", name, err);
                    continue;
                }
            };
            let record = match self.completed_tasks.get(&parsed.task_name) {
                // First observed completion wins...
                None => true,
                // ...except that a later value-typed result upgrades an
                // exception-typed one. A value entry is never replaced.
                Some(existing) => {
                    existing.parsed.result_type == ResultType::Exception
                        && parsed.result_type == ResultType::Value
                }
            };
            if !record {
                continue;
            }
            if parsed.result_type == ResultType::Exception {
                let envelope = ResultEnvelope::from_store(&self.store, &name).await?;
                envelope.log();
                if self.config.wait_to_raise_task_exception {
                    warn!("waiting for other tasks to run before raising exception");
                } else {
                    // Abort the job; already-dispatched workers are
                    // abandoned and reclaimed by Client::cleanup.
                    envelope.raise_if_error()?;
                }
            }
            debug!("observed completion for {}: {}", parsed.task_name, name);
            self.completed_tasks.insert(
                parsed.task_name.clone(),
                CompletedTask {
                    blob_name: name,
                    parsed,
                },
            );
        }
        Ok(())
    }

    /// Launch one attempt of a task whose input blob is already in the
    /// store. Also used for speculative re-submission.
    async fn submit_task(&mut self, task_name: &str) -> Result<()> {
        let queue_time = epoch_seconds_int();
        let attempt_num = self
            .task_attempts
            .get(task_name)
            .map(|attempts| attempts.len())
            .unwrap_or(0);
        let result_template = naming::task_result_template(task_name, attempt_num, queue_time);
        let input_name = naming::task_input_name(task_name)?;
        self.backend
            .submit_task(task_name, &input_name, &result_template)
            .await?;
        self.task_attempts
            .entry(task_name.to_string())
            .or_default()
            .push(queue_time);
        Ok(())
    }

    /// Pull tasks until one is actually launched. Tasks whose result is
    /// already present are recorded as reused without consuming an
    /// admission slot. Returns false once the iterator is exhausted.
    async fn submit_next_task(&mut self) -> Result<bool> {
        loop {
            let Some(task) = self.tasks.next() else {
                return Ok(false);
            };
            let task_name =
                naming::make_task_name(&self.config.cache_key, self.submitted_tasks.len())?;

            if let Some(completed) = self.completed_tasks.get(&task_name) {
                info!("using existing result: {}", completed.blob_name);
                self.reused_tasks.insert(task_name.clone());
                self.submitted_tasks.push(task_name);
                continue;
            }

            let input_name = naming::task_input_name(&task_name)?;
            let bytes = task.to_bytes()?;
            info!(
                "uploading: {} [{}] for task {}",
                input_name,
                human_readable_size(bytes.len() as u64),
                task_name
            );
            self.store.put(&input_name, bytes, None).await?;
            self.submit_task(&task_name).await?;
            self.submitted_tasks.push(task_name);
            self.status_writer.update(&self.snapshot()).await?;
            return Ok(true);
        }
    }

    /// Run the job to completion: the submission loop under admission
    /// control, then the drain phase.
    ///
    /// With `wait_to_raise_task_exception = false` the first observed
    /// task exception aborts the job immediately (best-effort
    /// abandonment: in-flight workers keep running and their blobs stay
    /// until cleanup). A task that never produces a result blob keeps
    /// `wait` looping; speculation is the mitigation.
    pub async fn wait(&mut self, poll: Duration) -> Result<()> {
        loop {
            self.update().await?;
            let target = self
                .config
                .max_simultaneous_tasks
                .saturating_sub(self.running_tasks().len());
            if target == 0 {
                tokio::time::sleep(poll).await;
                continue;
            }
            debug!("submitting up to {} tasks", target);
            for _ in 0..target {
                if !self.submit_next_task().await? {
                    return self.drain(poll).await;
                }
            }
        }
    }

    /// Everything has been submitted; poll until nothing is running,
    /// speculating on stragglers once the policy allows it.
    async fn drain(&mut self, poll: Duration) -> Result<()> {
        let mut threshold: Option<f64> = None;
        loop {
            self.update().await?;
            self.status_writer.update(&self.snapshot()).await?;
            let running = self.running_tasks();
            if running.is_empty() {
                info!(
                    "job {} complete: {} tasks, {} reused",
                    self.job_name,
                    self.submitted_tasks.len(),
                    self.reused_tasks.len()
                );
                return Ok(());
            }

            if threshold.is_none() && !self.submitted_tasks.is_empty() {
                let percent_running =
                    running.len() as f64 * 100.0 / self.submitted_tasks.len() as f64;
                if percent_running <= self.config.speculation.percent {
                    threshold = self.speculation_threshold(percent_running);
                }
            }
            if let Some(threshold) = threshold {
                self.speculate(threshold).await?;
            }

            info!(
                "waiting for {} tasks to complete: {}",
                running.len(),
                truncate(&running.join(" "), 500)
            );
            tokio::time::sleep(poll).await;
        }
    }

    /// Elapsed-time percentile over completions of never-speculated
    /// tasks. None until at least one such completion exists.
    fn speculation_threshold(&self, percent_running: f64) -> Option<f64> {
        let elapsed: Vec<f64> = self
            .completed_tasks
            .values()
            .filter(|completed| {
                self.task_attempts
                    .get(&completed.parsed.task_name)
                    .map(|attempts| attempts.len() <= 1)
                    .unwrap_or(true)
            })
            .map(|completed| completed.parsed.elapsed_seconds())
            .collect();
        if elapsed.is_empty() {
            return None;
        }
        let threshold = percentile(&elapsed, self.config.speculation.runtime_percentile);
        let min = elapsed.iter().copied().fold(f64::INFINITY, f64::min);
        let max = elapsed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = elapsed.iter().sum::<f64>() / elapsed.len() as f64;
        info!(
            "enabling speculation: {:.2}% of tasks running; task elapsed times (sec): \
             min={:.1} mean={:.1} max={:.1}; rerun threshold is the {:.0} percentile, {:.2}",
            percent_running, min, mean, max, self.config.speculation.runtime_percentile, threshold
        );
        Some(threshold)
    }

    async fn speculate(&mut self, threshold: f64) -> Result<()> {
        let now = epoch_seconds();
        let running = self.running_tasks();
        let eligible: Vec<String> = running
            .iter()
            .filter(|task_name| {
                let Some(attempts) = self.task_attempts.get(task_name.as_str()) else {
                    return false;
                };
                let stale = attempts
                    .last()
                    .map(|last| (*last as f64) < now - threshold)
                    .unwrap_or(false);
                stale && attempts.len() < self.config.speculation.max_reruns
            })
            .cloned()
            .collect();
        debug!(
            "{} of {} running tasks eligible for speculative rerun (threshold {:.2}s)",
            eligible.len(),
            running.len(),
            threshold
        );
        if eligible.is_empty() {
            return Ok(());
        }

        // Capacity counts in-flight attempts, not tasks.
        let in_flight: usize = running
            .iter()
            .map(|task_name| {
                self.task_attempts
                    .get(task_name.as_str())
                    .map(|attempts| attempts.len())
                    .unwrap_or(0)
            })
            .sum();
        let capacity = self
            .config
            .max_simultaneous_tasks
            .saturating_sub(in_flight);
        let to_speculate: Vec<String> = eligible.into_iter().take(capacity).collect();
        if to_speculate.is_empty() {
            return Ok(());
        }
        info!(
            "capacity for {} speculative attempts; re-running {} tasks",
            capacity,
            to_speculate.len()
        );
        for task_name in &to_speculate {
            // The input blob is still in the store; only the backend
            // invocation is repeated, under a fresh attempt number.
            self.submit_task(task_name).await?;
        }
        Ok(())
    }

    /// Stream envelopes in submission order. Fails while anything is
    /// still running.
    pub async fn results(&mut self) -> Result<ResultStream> {
        self.update().await?;
        if !self.running_tasks().is_empty() {
            bail!("not all tasks have completed");
        }
        let entries = self
            .submitted_tasks
            .iter()
            .map(|task_name| {
                let completed = self
                    .completed_tasks
                    .get(task_name)
                    .with_context(|| format!("no completion recorded for {}", task_name))?;
                Ok(completed.blob_name.clone())
            })
            .collect::<Result<Vec<String>>>()?;
        Ok(ResultStream {
            store: self.store.clone(),
            entries,
            index: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn attempt_count(&self, task_name: &str) -> usize {
        self.task_attempts
            .get(task_name)
            .map(|attempts| attempts.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn reused_count(&self) -> usize {
        self.reused_tasks.len()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_name", &self.job_name)
            .field("cache_key", &self.config.cache_key)
            .field("submitted", &self.submitted_tasks.len())
            .field("completed", &self.completed_tasks.len())
            .finish()
    }
}

/// Lazily fetches result envelopes, one blob per `next` call.
#[derive(Debug)]
pub struct ResultStream {
    store: Store,
    entries: Vec<String>,
    index: usize,
}

impl ResultStream {
    pub async fn next(&mut self) -> Option<Result<ResultEnvelope>> {
        let blob_name = self.entries.get(self.index)?.clone();
        self.index += 1;
        Some(ResultEnvelope::from_store(&self.store, &blob_name).await)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Linear-interpolation percentile over a copied, sorted sample. Fine
/// up to around 1e5 tasks; larger jobs would want an online estimator.
fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    sorted[lo] * (1.0 - weight) + sorted[hi] * weight
}
