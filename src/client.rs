//! The public entry point: build a backend and a store, then `map` a
//! registered task function over an iterable and stream the results.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::{Backend, BackendArgs};
use crate::job::{Job, JobConfig, SpeculationPolicy};
use crate::naming::{self, StatusPageName};
use crate::remote_object::RemoteObject;
use crate::store::Store;
use crate::task::{Task, TaskRegistry};

/// The client argument surface, flattened into user binaries' parsers.
#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    #[arg(long = "fanout-max-simultaneous-tasks", default_value_t = 10)]
    pub max_simultaneous_tasks: usize,

    #[arg(long = "fanout-poll-seconds", default_value_t = 30.0)]
    pub poll_seconds: f64,

    /// Local directory or bucket URL shared with workers.
    #[arg(long = "fanout-storage", env = "FANOUT_STORAGE")]
    pub storage: String,

    /// Set this to the same value in multiple clients and they will
    /// reuse each other's results. Advanced use only.
    #[arg(long = "fanout-cache-key-prefix")]
    pub cache_key_prefix: Option<String>,

    #[arg(long = "fanout-never-cleanup")]
    pub never_cleanup: bool,

    /// Keep running remaining tasks when one fails; the failure is
    /// re-raised once result iteration reaches it.
    #[arg(long = "fanout-wait-to-raise-task-exception")]
    pub wait_to_raise_task_exception: bool,

    #[arg(long = "fanout-speculation-percent", default_value_t = 20.0)]
    pub speculation_percent: f64,

    #[arg(long = "fanout-speculation-runtime-percentile", default_value_t = 99.0)]
    pub speculation_runtime_percentile: f64,

    #[arg(long = "fanout-speculation-max-reruns", default_value_t = 3)]
    pub speculation_max_reruns: usize,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Programmatic construction settings; `ClientArgs` is the CLI face of
/// the same knobs.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_simultaneous_tasks: usize,
    pub poll_seconds: f64,
    pub cache_key_prefix: Option<String>,
    pub never_cleanup: bool,
    pub wait_to_raise_task_exception: bool,
    pub speculation: SpeculationPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            max_simultaneous_tasks: 10,
            poll_seconds: 30.0,
            cache_key_prefix: None,
            never_cleanup: false,
            wait_to_raise_task_exception: false,
            speculation: SpeculationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// 1 means every item gets its own task; 10 means the first ten
    /// items are one task, the next ten another, and so on.
    pub items_per_task: usize,
    /// Total item count, for progress output when the iterable itself
    /// cannot say.
    pub num_items: Option<usize>,
    /// Advanced use only, for reusing pre-existing results.
    pub cache_key: Option<String>,
}

pub struct Client {
    backend: Backend,
    store: Store,
    options: ClientOptions,
    cache_key_prefix: String,
    submitted_jobs: Vec<String>,
    next_object_num: u64,
}

impl Client {
    pub fn new(backend: Backend, store: Store, options: ClientOptions) -> Result<Client> {
        if !backend.supports_storage(&store) {
            bail!(
                "backend '{}' does not support storage: {}",
                backend.describe(),
                store.root()
            );
        }
        let cache_key_prefix = options
            .cache_key_prefix
            .clone()
            .unwrap_or_else(naming::make_cache_key_prefix);
        Ok(Client {
            backend,
            store,
            options,
            cache_key_prefix,
            submitted_jobs: Vec::new(),
            next_object_num: 1,
        })
    }

    /// Build a client, backend included, from the flag surface. The
    /// registry is what the in-process backend runs tasks against.
    pub fn from_args(args: &ClientArgs, registry: Arc<TaskRegistry>) -> Result<Client> {
        let store = Store::from_url(&args.storage)?;
        let backend = args.backend.build(&store, registry)?;
        Client::new(
            backend,
            store,
            ClientOptions {
                max_simultaneous_tasks: args.max_simultaneous_tasks,
                poll_seconds: args.poll_seconds,
                cache_key_prefix: args.cache_key_prefix.clone(),
                never_cleanup: args.never_cleanup,
                wait_to_raise_task_exception: args.wait_to_raise_task_exception,
                speculation: SpeculationPolicy {
                    percent: args.speculation_percent,
                    runtime_percentile: args.speculation_runtime_percentile,
                    max_reruns: args.speculation_max_reruns,
                },
            },
        )
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache_key_prefix(&self) -> &str {
        &self.cache_key_prefix
    }

    fn next_cache_key(&self) -> String {
        format!("{}-{:03}", self.cache_key_prefix, self.submitted_jobs.len())
    }

    /// Run a job over an explicit task sequence. Most callers want
    /// `map` instead.
    pub async fn submit(
        &mut self,
        tasks: Box<dyn Iterator<Item = Task> + Send>,
        num_tasks: Option<usize>,
        cache_key: Option<String>,
    ) -> Result<Job> {
        let cache_key = cache_key.unwrap_or_else(|| self.next_cache_key());
        let job = Job::new(
            self.backend.clone(),
            self.store.clone(),
            tasks,
            JobConfig {
                cache_key,
                max_simultaneous_tasks: self.options.max_simultaneous_tasks,
                num_tasks,
                wait_to_raise_task_exception: self.options.wait_to_raise_task_exception,
                speculation: self.options.speculation,
            },
        )
        .await?;
        self.submitted_jobs.push(job.job_name().to_string());
        Ok(job)
    }

    /// Parallel map: partition the items into tasks, run them all, and
    /// return the per-item results in order.
    pub async fn map<I>(&mut self, function: &str, items: I, options: MapOptions) -> Result<MapResults>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        let items_per_task = options.items_per_task.max(1);
        let mut items = items.into_iter();
        let function = function.to_string();
        let grouped = std::iter::from_fn(move || {
            let group: Vec<Value> = items.by_ref().take(items_per_task).collect();
            (!group.is_empty()).then(|| Task::new(function.clone(), group))
        });
        let num_tasks = options
            .num_items
            .map(|n| n.div_ceil(items_per_task));

        let mut job = self
            .submit(Box::new(grouped), num_tasks, options.cache_key)
            .await?;
        let poll = Duration::from_secs_f64(self.options.poll_seconds);
        if let Err(err) = job.wait(poll).await {
            let names = [job.job_name().to_string()];
            if let Err(mark_err) = mark_jobs_done(&self.store, Some(&names)).await {
                warn!("failed to mark job done after error: {:#}", mark_err);
            }
            return Err(err);
        }
        let stream = job.results().await?;
        Ok(MapResults {
            store: self.store.clone(),
            job_name: job.job_name().to_string(),
            stream,
            pending: VecDeque::new(),
            finished: false,
        })
    }

    /// Rename the given jobs' status pages (all jobs when `None`) from
    /// active to done. Idempotent.
    pub async fn mark_jobs_done(&self, job_names: Option<&[String]>) -> Result<()> {
        mark_jobs_done(&self.store, job_names).await
    }

    /// Delete every input and result blob a finished job's cache key
    /// owns, then mark its status pages done.
    pub async fn cleanup_job(&self, job_name: &str) -> Result<()> {
        let fields = naming::JOB.parse(job_name)?;
        let cache_key = &fields["cache_key"];
        let results = self
            .store
            .list(&naming::task_result_prefix(cache_key, Vec::new()))
            .await?;
        let inputs = self.store.list(&naming::task_input_prefix(cache_key)).await?;
        info!(
            "cleaning up cache key '{}': {} results, {} inputs",
            cache_key,
            results.len(),
            inputs.len()
        );
        for name in results.iter().chain(inputs.iter()) {
            self.store.delete(name).await?;
        }
        let names = [job_name.to_string()];
        mark_jobs_done(&self.store, Some(&names)).await
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if self.options.never_cleanup {
            warn!("cleanup disabled; skipping");
            return Ok(());
        }
        for job_name in self.submitted_jobs.clone() {
            info!("cleaning up for job: {}", job_name);
            self.cleanup_job(&job_name).await?;
        }
        Ok(())
    }

    /// Parsed status-page identities for the given jobs (all jobs when
    /// `None`).
    pub async fn job_summary(
        &self,
        job_names: Option<&[String]>,
        include_done: bool,
    ) -> Result<Vec<StatusPageName>> {
        let statuses: &[&str] = if include_done {
            &["active", "done"]
        } else {
            &["active"]
        };
        let prefixes = naming::status_prefixes(job_names, Some(&["json"]), Some(statuses))?;
        let mut names = BTreeSet::new();
        for prefix in &prefixes {
            names.extend(self.store.list(prefix).await?);
        }
        let mut summaries = Vec::new();
        for name in names {
            match StatusPageName::parse(&name) {
                Ok(parsed) => summaries.push(parsed),
                Err(err) => warn!("skipping unrecognized status page {}: {:#}", name, err),
            }
        }
        Ok(summaries)
    }

    /// The parsed snapshot of one job's JSON status page.
    pub async fn job_status(&self, page: &StatusPageName) -> Result<Value> {
        let bytes = self.store.get(&page.make_string()?).await?;
        serde_json::from_slice(&bytes).context("parsing status page")
    }

    /// Upload a large value once and get back a handle tasks can
    /// capture cheaply.
    pub async fn remote_object<T: Serialize>(&mut self, value: T) -> Result<RemoteObject<T>> {
        let file_path = naming::make_remote_object_name(
            &self.cache_key_prefix,
            &naming::node_id(),
            self.next_object_num,
        )?;
        self.next_object_num += 1;
        RemoteObject::publish(&self.store, file_path, value).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("backend", &self.backend.describe())
            .field("storage", &self.store.root())
            .field("cache_key_prefix", &self.cache_key_prefix)
            .field("submitted_jobs", &self.submitted_jobs.len())
            .finish()
    }
}

/// Per-item results of one `map` call, flattened from the task
/// envelopes in submission order. A carried task failure is re-raised
/// at the position of its task; the job's status pages flip to done
/// when iteration completes or fails.
pub struct MapResults {
    store: Store,
    job_name: String,
    stream: crate::job::ResultStream,
    pending: VecDeque<Value>,
    finished: bool,
}

impl MapResults {
    pub async fn next(&mut self) -> Option<Result<Value>> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Some(Ok(value));
            }
            if self.finished {
                return None;
            }
            match self.stream.next().await {
                None => {
                    self.finished = true;
                    if let Err(err) = self.mark_done().await {
                        return Some(Err(err));
                    }
                    return None;
                }
                Some(Err(err)) => {
                    self.finished = true;
                    if let Err(mark_err) = self.mark_done().await {
                        warn!("failed to mark job done: {:#}", mark_err);
                    }
                    return Some(Err(err));
                }
                Some(Ok(envelope)) => {
                    envelope.log();
                    if let Err(err) = envelope.raise_if_error() {
                        self.finished = true;
                        if let Err(mark_err) = self.mark_done().await {
                            warn!("failed to mark job done: {:#}", mark_err);
                        }
                        return Some(Err(err));
                    }
                    match envelope.return_value {
                        Some(Value::Array(values)) => self.pending.extend(values),
                        Some(other) => self.pending.push_back(other),
                        None => {}
                    }
                }
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    async fn mark_done(&self) -> Result<()> {
        mark_jobs_done(&self.store, Some(std::slice::from_ref(&self.job_name))).await
    }
}

/// Rename `active::*` status pages to `done::*`. Already-done pages are
/// logged and left alone, which is what makes this idempotent.
pub(crate) async fn mark_jobs_done(store: &Store, job_names: Option<&[String]>) -> Result<()> {
    let prefixes = naming::status_prefixes(job_names, None, None)?;
    let mut pages = BTreeSet::new();
    for prefix in &prefixes {
        pages.extend(store.list(prefix).await?);
    }
    for source in pages {
        let parsed = match StatusPageName::parse(&source) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("skipping unrecognized status page {}: {:#}", source, err);
                continue;
            }
        };
        if parsed.status == "active" {
            let dest = StatusPageName {
                status: "done".to_string(),
                ..parsed.clone()
            }
            .make_string()?;
            info!(
                "marking job '{}' done: renaming {} -> {}",
                parsed.job_name, source, dest
            );
            store.rename(&source, &dest).await?;
        } else {
            info!("already marked done: {}", source);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InProcessBackend;
    use crate::task::TaskContext;
    use anyhow::bail;
    use clap::Parser;
    use serde::Deserialize;
    use serde_json::json;

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("square", |_ctx: TaskContext, x: i64| async move { Ok(x * x) });
        registry.register("add-five", |_ctx: TaskContext, x: i64| async move { Ok(x + 5) });
        registry.register("half", |_ctx: TaskContext, x: f64| async move {
            if x == 0.0 {
                bail!("division by zero");
            }
            Ok(2.0 / x)
        });
        registry.register("shifted-half", |_ctx: TaskContext, x: f64| async move {
            if x == 2.0 {
                bail!("division by zero");
            }
            Ok(2.0 / (x - 2.0))
        });
        registry.register("sleepy", |_ctx: TaskContext, x: i64| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(x)
        });
        registry
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        backend: InProcessBackend,
        client: Client,
    }

    fn fixture(registry: TaskRegistry, tweak: impl FnOnce(&mut ClientOptions)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        shared_fixture(dir, registry, tweak)
    }

    fn shared_fixture(
        dir: tempfile::TempDir,
        registry: TaskRegistry,
        tweak: impl FnOnce(&mut ClientOptions),
    ) -> Fixture {
        let store = Store::from_url(dir.path().to_str().unwrap()).unwrap();
        let backend = InProcessBackend::new(store.clone(), Arc::new(registry), false);
        let mut options = ClientOptions {
            poll_seconds: 0.02,
            ..ClientOptions::default()
        };
        tweak(&mut options);
        let client = Client::new(
            Backend::InProcess(backend.clone()),
            store.clone(),
            options,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store,
            backend,
            client,
        }
    }

    fn number_items(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(|x| json!(x)).collect()
    }

    #[tokio::test]
    async fn test_map_simple() {
        let mut fx = fixture(test_registry(), |_| {});
        let results = fx
            .client
            .map("half", number_items(1..10), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let expected: Vec<Value> = (1..10).map(|x| json!(2.0 / x as f64)).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn test_map_grouping() {
        let mut fx = fixture(test_registry(), |_| {});
        let results = fx
            .client
            .map(
                "add-five",
                number_items(0..10),
                MapOptions {
                    items_per_task: 3,
                    num_items: Some(10),
                    ..MapOptions::default()
                },
            )
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        // ceil(10 / 3) tasks, all ten items, in order.
        assert_eq!(fx.backend.submission_count(), 4);
        let expected: Vec<Value> = (0..10).map(|x| json!(x + 5)).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn test_map_raises_immediately_by_default() {
        let mut fx = fixture(test_registry(), |_| {});
        let err = fx
            .client
            .map("shifted-half", number_items(0..10), MapOptions::default())
            .await
            .err()
            .expect("map should fail on the task exception");
        assert!(format!("{:#}", err).contains("division by zero"));

        // The failed job's status pages were renamed before the error
        // surfaced.
        assert!(fx.client.job_summary(None, false).await.unwrap().is_empty());
        assert_eq!(fx.client.job_summary(None, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_map_wait_to_raise_defers_the_exception() {
        let mut fx = fixture(test_registry(), |options| {
            options.wait_to_raise_task_exception = true;
        });
        let mut results = fx
            .client
            .map("shifted-half", number_items(0..10), MapOptions::default())
            .await
            .unwrap();

        assert_eq!(results.next().await.unwrap().unwrap(), json!(-1.0));
        assert_eq!(results.next().await.unwrap().unwrap(), json!(-2.0));

        // Pages stay active until the deferred raise.
        assert_eq!(fx.client.job_summary(None, false).await.unwrap().len(), 1);

        let err = results.next().await.unwrap().err().expect("third item fails");
        assert!(format!("{:#}", err).contains("division by zero"));
        assert!(results.next().await.is_none());
        assert!(fx.client.job_summary(None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_reuse_across_clients() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = "sharedprefix".to_string();

        let key = prefix.clone();
        let mut first = shared_fixture(dir, test_registry(), |options| {
            options.cache_key_prefix = Some(key)
        });
        let results = first
            .client
            .map("square", number_items(0..5), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(0), json!(1), json!(4), json!(9), json!(16)]);
        assert_eq!(first.backend.submission_count(), 5);

        // A second client sharing the prefix reuses every result and
        // never touches its backend.
        let store = first.store.clone();
        let second_backend =
            InProcessBackend::new(store.clone(), Arc::new(test_registry()), false);
        let mut second = Client::new(
            Backend::InProcess(second_backend.clone()),
            store,
            ClientOptions {
                poll_seconds: 0.02,
                cache_key_prefix: Some(prefix),
                ..ClientOptions::default()
            },
        )
        .unwrap();
        let results = second
            .map("square", number_items(0..5), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(0), json!(1), json!(4), json!(9), json!(16)]);
        assert_eq!(second_backend.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let mut fx = fixture(test_registry(), |options| {
            options.max_simultaneous_tasks = 3;
        });
        let results = fx
            .client
            .map("sleepy", number_items(0..10), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(results.len(), 10);
        assert!(
            fx.backend.peak_simultaneous() <= 3,
            "saw {} simultaneous workers",
            fx.backend.peak_simultaneous()
        );
    }

    #[tokio::test]
    async fn test_mark_jobs_done_is_idempotent() {
        let mut fx = fixture(test_registry(), |_| {});
        fx.client
            .map("square", number_items(0..3), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        fx.client.mark_jobs_done(None).await.unwrap();
        let done_once = fx.store.list("done::").await.unwrap();
        fx.client.mark_jobs_done(None).await.unwrap();
        let done_twice = fx.store.list("done::").await.unwrap();
        assert_eq!(done_once, done_twice);
        assert_eq!(done_once.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_removes_inputs_results_and_marks_done() {
        let mut fx = fixture(test_registry(), |options| {
            options.cache_key_prefix = Some("cleanme".to_string());
        });
        fx.client
            .map("square", number_items(0..4), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert!(!fx.store.list("result::cleanme").await.unwrap().is_empty());

        fx.client.cleanup().await.unwrap();
        assert!(fx.store.list("input::cleanme").await.unwrap().is_empty());
        assert!(fx.store.list("result::cleanme").await.unwrap().is_empty());
        assert!(fx.store.list("active::").await.unwrap().is_empty());
        assert!(!fx.store.list("done::").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_never_cleanup_keeps_blobs() {
        let mut fx = fixture(test_registry(), |options| {
            options.never_cleanup = true;
            options.cache_key_prefix = Some("keepme".to_string());
        });
        fx.client
            .map("square", number_items(0..2), MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        fx.client.cleanup().await.unwrap();
        assert!(!fx.store.list("result::keepme").await.unwrap().is_empty());
    }

    #[derive(Debug, Deserialize)]
    struct OffsetItem {
        offsets: RemoteObject<Vec<i64>>,
        index: usize,
    }

    #[tokio::test]
    async fn test_remote_object_flows_through_tasks() {
        let mut registry = test_registry();
        registry.register(
            "offset-lookup",
            |ctx: TaskContext, item: OffsetItem| async move {
                let offsets = item.offsets.value(ctx.store()).await?;
                Ok(offsets[item.index])
            },
        );
        let mut fx = fixture(registry, |_| {});

        let offsets: Vec<i64> = (0..1000).map(|i| i * 10).collect();
        let handle = fx.client.remote_object(offsets).await.unwrap();
        let handle_value = serde_json::to_value(&handle).unwrap();

        let items: Vec<Value> = (0..5)
            .map(|index| json!({ "offsets": handle_value.clone(), "index": index }))
            .collect();
        let results = fx
            .client
            .map("offset-lookup", items, MapOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![json!(0), json!(10), json!(20), json!(30), json!(40)]
        );
    }

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        client: ClientArgs,
    }

    #[test]
    fn test_argument_surface_defaults() {
        let cli = TestCli::try_parse_from(["prog", "--fanout-storage", "/tmp/fanout"]).unwrap();
        let args = cli.client;
        assert_eq!(args.max_simultaneous_tasks, 10);
        assert_eq!(args.poll_seconds, 30.0);
        assert_eq!(args.storage, "/tmp/fanout");
        assert!(args.cache_key_prefix.is_none());
        assert!(!args.never_cleanup);
        assert!(!args.wait_to_raise_task_exception);
        assert_eq!(args.speculation_percent, 20.0);
        assert_eq!(args.speculation_runtime_percentile, 99.0);
        assert_eq!(args.speculation_max_reruns, 3);
    }

    #[test]
    fn test_backend_storage_mismatch_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = TestCli::try_parse_from([
            "prog",
            "--fanout-storage",
            dir.path().to_str().unwrap(),
            "--fanout-backend",
            "kubernetes",
        ])
        .unwrap();
        let err = Client::from_args(&cli.client, Arc::new(TaskRegistry::new()))
            .err()
            .expect("kubernetes backend must reject a local store");
        assert!(format!("{:#}", err).contains("does not support storage"));
    }
}
