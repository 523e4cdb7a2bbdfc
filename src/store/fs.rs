//! Filesystem blob store: names are file names inside a root directory.
//! No transport retries; local I/O errors are surfaced as-is.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct FsStore {
    url: String,
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: &str) -> Result<Self> {
        let path = PathBuf::from(root);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating storage root {}", path.display()))?;
        Ok(FsStore {
            url: root.to_string(),
            root: path,
        })
    }

    pub fn root(&self) -> &str {
        &self.url
    }

    pub async fn put(&self, name: &str, bytes: Bytes) -> Result<()> {
        // Write-then-rename so concurrent listers never observe a
        // partially written blob.
        let tmp = self.root.join(format!(
            ".tmp-{}-{:016x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        let dest = self.root.join(name);
        tokio::fs::rename(&tmp, &dest)
            .await
            .with_context(|| format!("publishing {}", dest.display()))?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.root.join(name);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))?;
        Ok(Bytes::from(data))
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && !name.starts_with(".tmp-") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting {}", path.display())),
        }
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let from = self.root.join(src);
        let to = self.root.join(dst);
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("renaming {} -> {}", from.display(), to.display()))?;
        Ok(())
    }

    pub fn access_info(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        store
            .put("input::key::0", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let data = store.get("input::key::0").await.unwrap();
        assert_eq!(&data[..], b"hello");

        // Overwrite is allowed.
        store
            .put("input::key::0", Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(&store.get("input::key::0").await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_get_missing_fails() {
        let (_dir, store) = store();
        assert!(store.get("no-such-blob").await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_filtered() {
        let (_dir, store) = store();
        for name in ["result::a::2", "result::a::10", "input::a::0"] {
            store.put(name, Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(
            store.list("result::a").await.unwrap(),
            vec!["result::a::10", "result::a::2"]
        );
        assert_eq!(store.list("zzz").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store.put("blob", Bytes::from_static(b"x")).await.unwrap();
        store.delete("blob").await.unwrap();
        store.delete("blob").await.unwrap();
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename() {
        let (_dir, store) = store();
        store
            .put("active::json::job.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .rename("active::json::job.json", "done::json::job.json")
            .await
            .unwrap();
        assert_eq!(
            store.list("").await.unwrap(),
            vec!["done::json::job.json"]
        );
    }
}
