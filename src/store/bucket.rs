//! Object-storage blob store for `s3://` and `gs://` roots.
//!
//! Transient transport errors are retried inside `object_store` with
//! exponential backoff: first sleep 2 s, base 2, up to 12 attempts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{BackoffConfig, ObjectStore, RetryConfig};
use url::Url;

fn retry_config() -> RetryConfig {
    RetryConfig {
        backoff: BackoffConfig {
            init_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(512),
            base: 2.0,
        },
        max_retries: 12,
        retry_timeout: Duration::from_secs(15 * 60),
    }
}

fn parse_root(root: &str) -> Result<(String, String, ObjectPath)> {
    let parsed = Url::parse(root).with_context(|| format!("invalid bucket url {}", root))?;
    let bucket = parsed
        .host_str()
        .with_context(|| format!("bucket url {} has no bucket name", root))?
        .to_string();
    let prefix = ObjectPath::parse(parsed.path().trim_matches('/'))
        .with_context(|| format!("invalid bucket path in {}", root))?;
    Ok((parsed.scheme().to_string(), bucket, prefix))
}

#[derive(Clone)]
pub struct BucketStore {
    url: String,
    scheme: String,
    bucket: String,
    prefix: ObjectPath,
    inner: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore").field("url", &self.url).finish()
    }
}

impl BucketStore {
    /// Credentials come from the environment, the way the hosting cloud
    /// SDKs supply them.
    pub fn from_url(root: &str) -> Result<Self> {
        let (scheme, bucket, prefix) = parse_root(root)?;
        let inner: Arc<dyn ObjectStore> = match scheme.as_str() {
            "s3" => Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(&bucket)
                    .with_retry(retry_config())
                    .build()
                    .context("building s3 client")?,
            ),
            "gs" => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(&bucket)
                    .with_retry(retry_config())
                    .build()
                    .context("building gcs client")?,
            ),
            scheme => bail!("unsupported storage scheme: {}://", scheme),
        };
        Ok(Self::with_inner(root, scheme, bucket, prefix, inner))
    }

    fn with_inner(
        root: &str,
        scheme: String,
        bucket: String,
        prefix: ObjectPath,
        inner: Arc<dyn ObjectStore>,
    ) -> Self {
        BucketStore {
            url: root.trim_end_matches('/').to_string(),
            scheme,
            bucket,
            prefix,
            inner,
        }
    }

    pub fn root(&self) -> &str {
        &self.url
    }

    fn location(&self, name: &str) -> ObjectPath {
        self.prefix.child(name)
    }

    fn name_of(&self, location: &ObjectPath) -> Option<String> {
        let full = location.as_ref();
        let base = self.prefix.as_ref();
        if base.is_empty() {
            Some(full.to_string())
        } else {
            full.strip_prefix(base)?
                .strip_prefix('/')
                .map(|s| s.to_string())
        }
    }

    pub async fn put(&self, name: &str, bytes: Bytes, _mime: Option<&str>) -> Result<()> {
        let location = self.location(name);
        self.inner
            .put(&location, bytes)
            .await
            .with_context(|| format!("uploading {}", location))?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let location = self.location(name);
        let result = self
            .inner
            .get(&location)
            .await
            .with_context(|| format!("downloading {}", location))?;
        let bytes = result
            .bytes()
            .await
            .with_context(|| format!("downloading {}", location))?;
        Ok(bytes)
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let scope = if self.prefix.as_ref().is_empty() {
            None
        } else {
            Some(self.prefix.clone())
        };
        let objects: Vec<object_store::ObjectMeta> = self
            .inner
            .list(scope.as_ref())
            .await
            .context("listing bucket")?
            .try_collect()
            .await
            .context("listing bucket")?;
        let mut names: Vec<String> = objects
            .iter()
            .filter_map(|meta| self.name_of(&meta.location))
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let location = self.location(name);
        match self.inner.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting {}", location)),
        }
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let from = self.location(src);
        let to = self.location(dst);
        self.inner
            .rename(&from, &to)
            .await
            .with_context(|| format!("renaming {} -> {}", from, to))?;
        Ok(())
    }

    pub fn access_info(&self, name: &str) -> String {
        let path = self.location(name);
        match self.scheme.as_str() {
            "gs" => format!("https://storage.cloud.google.com/{}/{}", self.bucket, path),
            "s3" => format!("https://{}.s3.amazonaws.com/{}", self.bucket, path),
            _ => format!("{}/{}", self.url, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_store(root: &str) -> BucketStore {
        let (scheme, bucket, prefix) = parse_root(root).unwrap();
        BucketStore::with_inner(root, scheme, bucket, prefix, Arc::new(InMemory::new()))
    }

    #[test]
    fn test_parse_root() {
        let (scheme, bucket, prefix) = parse_root("s3://my-bucket/jobs/dev").unwrap();
        assert_eq!(scheme, "s3");
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix.as_ref(), "jobs/dev");

        let (_, _, prefix) = parse_root("gs://data").unwrap();
        assert_eq!(prefix.as_ref(), "");

        assert!(parse_root("not a url").is_err());
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(BucketStore::from_url("ftp://bucket/x").is_err());
    }

    #[tokio::test]
    async fn test_put_get_list_under_prefix() {
        let store = memory_store("gs://data/jobs");
        store
            .put("result::k::0", Bytes::from_static(b"a"), None)
            .await
            .unwrap();
        store
            .put("input::k::0", Bytes::from_static(b"b"), Some("application/json"))
            .await
            .unwrap();

        assert_eq!(&store.get("result::k::0").await.unwrap()[..], b"a");
        assert_eq!(store.list("result::").await.unwrap(), vec!["result::k::0"]);
        assert_eq!(
            store.list("").await.unwrap(),
            vec!["input::k::0", "result::k::0"]
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_rename_moves() {
        let store = memory_store("s3://bucket/x");
        store
            .put("active::json::j.json", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        store
            .rename("active::json::j.json", "done::json::j.json")
            .await
            .unwrap();
        assert_eq!(store.list("").await.unwrap(), vec!["done::json::j.json"]);

        store.delete("done::json::j.json").await.unwrap();
        store.delete("done::json::j.json").await.unwrap();
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[test]
    fn test_access_info() {
        let store = memory_store("gs://data/b");
        assert_eq!(
            store.access_info("result::k"),
            "https://storage.cloud.google.com/data/b/result::k"
        );
    }
}
