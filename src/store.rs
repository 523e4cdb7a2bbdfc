//! The shared blob store: the only channel between driver and workers.
//!
//! Names are opaque flat strings under a single root. The filesystem
//! backend maps names to files in a directory; the bucket backend maps
//! them to objects under a `s3://` or `gs://` URL.

use anyhow::Result;
use bytes::Bytes;

pub mod bucket;
pub mod fs;

pub use bucket::BucketStore;
pub use fs::FsStore;

pub fn is_bucket_url(root: &str) -> bool {
    root.starts_with("s3://") || root.starts_with("gs://")
}

#[derive(Debug, Clone)]
pub enum Store {
    Fs(FsStore),
    Bucket(BucketStore),
}

impl Store {
    /// Open a store rooted at a local directory or a bucket URL.
    pub fn from_url(root: &str) -> Result<Store> {
        if is_bucket_url(root) {
            Ok(Store::Bucket(BucketStore::from_url(root)?))
        } else {
            Ok(Store::Fs(FsStore::new(root)?))
        }
    }

    /// The root string this store was opened with.
    pub fn root(&self) -> &str {
        match self {
            Store::Fs(store) => store.root(),
            Store::Bucket(store) => store.root(),
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, Store::Bucket(_))
    }

    /// Overwrite-safe upload. Blobs appear atomically: a reader either
    /// sees the full bytes or nothing.
    pub async fn put(&self, name: &str, bytes: Bytes, mime: Option<&str>) -> Result<()> {
        match self {
            Store::Fs(store) => store.put(name, bytes).await,
            Store::Bucket(store) => store.put(name, bytes, mime).await,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Bytes> {
        match self {
            Store::Fs(store) => store.get(name).await,
            Store::Bucket(store) => store.get(name).await,
        }
    }

    /// All names under the root beginning with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Store::Fs(store) => store.list(prefix).await,
            Store::Bucket(store) => store.list(prefix).await,
        }
    }

    /// Idempotent removal.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self {
            Store::Fs(store) => store.delete(name).await,
            Store::Bucket(store) => store.delete(name).await,
        }
    }

    /// Atomic rename within the same backend.
    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        match self {
            Store::Fs(store) => store.rename(src, dst).await,
            Store::Bucket(store) => store.rename(src, dst).await,
        }
    }

    /// Best-effort viewer URL for logs.
    pub fn access_info(&self, name: &str) -> String {
        match self {
            Store::Fs(store) => store.access_info(name),
            Store::Bucket(store) => store.access_info(name),
        }
    }
}
