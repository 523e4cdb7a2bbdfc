//! Write-once, read-lazy handles for large values shared by many tasks.
//!
//! Serializing a big captured value into every task input multiplies the
//! upload volume by the task count. A remote object is uploaded once by
//! the driver; tasks capture only the handle, which serializes to just
//! the blob path. Workers load the value on first access and cache it.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::common::human_readable_size;
use crate::store::Store;

pub struct RemoteObject<T> {
    file_path: String,
    cell: OnceCell<T>,
}

#[derive(Serialize, Deserialize)]
struct RemoteObjectRepr {
    file_path: String,
}

impl<T> RemoteObject<T> {
    /// Driver side: upload the value and return a loaded handle. The
    /// blob is written exactly once; the handle never rewrites it.
    pub async fn publish(store: &Store, file_path: String, value: T) -> Result<Self>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(&value).context("serializing remote object")?;
        info!(
            "writing object ({}): {}",
            human_readable_size(bytes.len() as u64),
            file_path
        );
        store
            .put(&file_path, bytes.into(), Some("application/json"))
            .await?;
        let cell = OnceCell::new();
        let _ = cell.set(value);
        Ok(RemoteObject { file_path, cell })
    }

    /// The value, fetched from the store on first access.
    pub async fn value(&self, store: &Store) -> Result<&T>
    where
        T: DeserializeOwned,
    {
        self.cell
            .get_or_try_init(|| async {
                debug!("loading remote object: {}", self.file_path);
                let bytes = store.get(&self.file_path).await?;
                serde_json::from_slice(&bytes).context("deserializing remote object")
            })
            .await
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }
}

impl<T> std::fmt::Debug for RemoteObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("file_path", &self.file_path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl<T> Serialize for RemoteObject<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        RemoteObjectRepr {
            file_path: self.file_path.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for RemoteObject<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = RemoteObjectRepr::deserialize(deserializer)?;
        Ok(RemoteObject {
            file_path: repr.file_path,
            cell: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_url(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_handle_is_small_and_lazy() {
        let (_dir, store) = store();
        let big: Vec<i64> = (0..10_000).collect();
        let raw_size = serde_json::to_vec(&big).unwrap().len();

        let handle = RemoteObject::publish(&store, "object::pre::node-x::1".to_string(), big.clone())
            .await
            .unwrap();
        assert!(handle.is_loaded());

        let encoded = serde_json::to_vec(&handle).unwrap();
        assert!(
            encoded.len() * 10 <= raw_size,
            "handle ({} bytes) should be under 10% of the value ({} bytes)",
            encoded.len(),
            raw_size
        );

        // Worker side: deserialize, then load on first access.
        let remote: RemoteObject<Vec<i64>> = serde_json::from_slice(&encoded).unwrap();
        assert!(!remote.is_loaded());
        assert_eq!(remote.value(&store).await.unwrap(), &big);
        assert!(remote.is_loaded());
        assert_eq!(remote.value(&store).await.unwrap(), &big);
    }

    #[tokio::test]
    async fn test_missing_blob_fails_load() {
        let (_dir, store) = store();
        let remote: RemoteObject<Vec<i64>> =
            serde_json::from_str(r#"{"file_path": "object::gone::node-x::9"}"#).unwrap();
        assert!(remote.value(&store).await.is_err());
        assert!(!remote.is_loaded());
    }
}
