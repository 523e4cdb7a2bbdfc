//! Distributed map over iterables.
//!
//! A [`Client`] partitions an iterable into tasks, ships each task to a
//! worker through a shared blob store (a local directory or an object
//! storage bucket), polls the store for result blobs, and yields the
//! per-item results in order. Workers can be in-process tokio tasks,
//! local subprocesses, local containers, or cluster pods — they never
//! share anything with the driver except the store.
//!
//! Task functions are registered by name in a [`TaskRegistry`]; the
//! worker binary resolves the name and maps the function over the
//! task's items.

pub mod backend;
pub mod client;
pub mod commands;
pub mod common;
pub mod job;
pub mod naming;
pub mod remote_object;
pub mod result;
pub mod status;
pub mod store;
pub mod task;
pub mod worker;

pub use client::{Client, ClientArgs, ClientOptions, MapOptions, MapResults};
pub use job::{Job, JobConfig, ResultStream, SpeculationPolicy};
pub use remote_object::RemoteObject;
pub use result::{ResultEnvelope, ResultType, TaskError};
pub use store::Store;
pub use task::{builtin_registry, Task, TaskContext, TaskRegistry};
