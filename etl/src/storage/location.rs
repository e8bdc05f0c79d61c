use super::S3Manager;
use common::{Error, Result};
use datafusion::execution::context::SessionContext;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// A configured input pattern or output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    S3 { bucket: String, key: String },
    Local(PathBuf),
}

impl StorageUrl {
    /// Accepts `s3://`, `s3a://`, `s3n://`, `file://` and plain filesystem paths.
    /// Glob characters in the key are kept verbatim.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();

        for scheme in ["s3://", "s3a://", "s3n://"] {
            if let Some(rest) = trimmed.strip_prefix(scheme) {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(Error::InvalidUri(format!("'{}' has no bucket name", raw)));
                }
                return Ok(StorageUrl::S3 {
                    bucket: bucket.to_string(),
                    key: key.trim_start_matches('/').to_string(),
                });
            }
        }

        if trimmed.starts_with("file://") {
            let url = Url::parse(trimmed)?;
            let path = url
                .to_file_path()
                .map_err(|_| Error::InvalidUri(format!("'{}' is not a local file URL", raw)))?;
            return Ok(StorageUrl::Local(path));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            return Err(Error::InvalidUri(format!(
                "Unsupported scheme '{}' in '{}'",
                scheme, raw
            )));
        }

        if trimmed.is_empty() {
            return Err(Error::InvalidUri("empty location".to_string()));
        }

        Ok(StorageUrl::Local(PathBuf::from(trimmed)))
    }

    pub fn bucket(&self) -> Option<&str> {
        match self {
            StorageUrl::S3 { bucket, .. } => Some(bucket),
            StorageUrl::Local(_) => None,
        }
    }

    /// The location in the form DataFusion's listing tables resolve.
    pub fn to_datafusion_path(&self) -> String {
        match self {
            StorageUrl::S3 { bucket, key } => format!("s3://{}/{}", bucket, key),
            StorageUrl::Local(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// Root under which the star schema tables are written.
///
/// DataFusion writes through `url_for`; publishing (list/move/delete) goes
/// through the object store with paths from `path_for`. Both views address
/// the same objects.
#[derive(Clone)]
pub struct OutputLocation {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    base_url: String,
    local_root: Option<PathBuf>,
}

impl std::fmt::Debug for OutputLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLocation")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OutputLocation {
    pub fn local(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;

        let store = LocalFileSystem::new_with_prefix(&root)?;
        let base_url = Url::from_directory_path(&root).map_err(|_| {
            Error::InvalidUri(format!("Cannot express {} as a file URL", root.display()))
        })?;

        Ok(Self {
            store: Arc::new(store),
            prefix: ObjectPath::default(),
            base_url: base_url.to_string(),
            local_root: Some(root),
        })
    }

    pub async fn s3(
        manager: &S3Manager,
        ctx: &SessionContext,
        bucket: &str,
        key: &str,
    ) -> Result<Self> {
        manager.register_object_store(ctx, bucket).await?;
        let store = manager.get_object_store(bucket).await?;

        let key = key.trim_matches('/');
        let base_url = if key.is_empty() {
            format!("s3://{}/", bucket)
        } else {
            format!("s3://{}/{}/", bucket, key)
        };

        Ok(Self {
            store,
            prefix: ObjectPath::from(key),
            base_url,
            local_root: None,
        })
    }

    pub async fn from_url(
        url: &StorageUrl,
        manager: Option<&S3Manager>,
        ctx: &SessionContext,
    ) -> Result<Self> {
        match url {
            StorageUrl::Local(path) => Self::local(path),
            StorageUrl::S3 { bucket, key } => {
                let manager = manager.ok_or_else(|| {
                    Error::Storage(format!(
                        "No S3 credentials available for output bucket '{}'",
                        bucket
                    ))
                })?;
                Self::s3(manager, ctx, bucket, key).await
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Directory URL (trailing slash) for a path relative to the root.
    pub fn url_for(&self, relative: &str) -> String {
        format!("{}{}/", self.base_url, relative.trim_matches('/'))
    }

    pub fn path_for(&self, relative: &str) -> ObjectPath {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.prefix.clone(), |path, part| path.child(part))
    }

    pub async fn list(&self, relative: &str) -> Result<Vec<ObjectPath>> {
        let prefix = self.path_for(relative);
        let listed: Vec<object_store::ObjectMeta> =
            match self.store.list(Some(&prefix)).try_collect().await {
                Ok(listed) => listed,
                Err(object_store::Error::NotFound { .. }) => Vec::new(),
                Err(e) => return Err(e.into()),
            };

        let mut paths: Vec<ObjectPath> = listed.into_iter().map(|meta| meta.location).collect();
        paths.sort();
        Ok(paths)
    }

    /// Deletes every object below `relative`; returns how many were removed.
    pub async fn delete_all(&self, relative: &str) -> Result<usize> {
        let paths = self.list(relative).await?;
        for path in &paths {
            self.delete_if_exists(path).await?;
        }
        self.remove_local_dir(relative)?;
        Ok(paths.len())
    }

    pub async fn delete_if_exists(&self, path: &ObjectPath) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes directories below `relative` (itself included) that hold no files.
    /// A no-op on object stores.
    pub fn prune_empty_dirs(&self, relative: &str) -> Result<()> {
        let Some(root) = &self.local_root else {
            return Ok(());
        };
        prune_dir(&root.join(relative.trim_matches('/')))?;
        Ok(())
    }

    /// Object stores have no directories, the local filesystem does.
    fn remove_local_dir(&self, relative: &str) -> Result<()> {
        let Some(root) = &self.local_root else {
            return Ok(());
        };

        let dir = root.join(relative.trim_matches('/'));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Returns whether `dir` was removed.
fn prune_dir(dir: &Path) -> std::io::Result<bool> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut empty = true;
    for entry in entries {
        let path = entry?.path();
        if !(path.is_dir() && prune_dir(&path)?) {
            empty = false;
        }
    }

    if empty {
        std::fs::remove_dir(dir)?;
    }
    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_parse_s3a_keeps_glob() {
        let url = StorageUrl::parse("s3a://udacity-dend/song_data/*/*/*/*.json").unwrap();
        assert_eq!(
            url,
            StorageUrl::S3 {
                bucket: "udacity-dend".to_string(),
                key: "song_data/*/*/*/*.json".to_string(),
            }
        );
        assert_eq!(url.bucket(), Some("udacity-dend"));
        assert_eq!(
            url.to_datafusion_path(),
            "s3://udacity-dend/song_data/*/*/*/*.json"
        );
    }

    #[test]
    fn test_parse_bucket_only() {
        let url = StorageUrl::parse("s3://out").unwrap();
        assert_eq!(
            url,
            StorageUrl::S3 {
                bucket: "out".to_string(),
                key: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_local_and_file_url() {
        assert_eq!(
            StorageUrl::parse("data/log_data/*.json").unwrap(),
            StorageUrl::Local(PathBuf::from("data/log_data/*.json"))
        );
        assert_eq!(
            StorageUrl::parse("file:///tmp/out").unwrap(),
            StorageUrl::Local(PathBuf::from("/tmp/out"))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            StorageUrl::parse("gs://bucket/x"),
            Err(Error::InvalidUri(_))
        ));
        assert!(StorageUrl::parse("s3:///key").is_err());
    }

    #[tokio::test]
    async fn test_local_output_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputLocation::local(dir.path().join("warehouse")).unwrap();
        assert!(output.base_url().starts_with("file://"));
        assert!(output.url_for("songs").ends_with("/songs/"));

        let first = output.path_for("songs/year=2018/a.parquet");
        let second = output.path_for("songs/b.parquet");
        output
            .store()
            .put(&first, Bytes::from_static(b"a").into())
            .await
            .unwrap();
        output
            .store()
            .put(&second, Bytes::from_static(b"b").into())
            .await
            .unwrap();

        assert_eq!(output.list("songs").await.unwrap().len(), 2);
        assert!(output.list("missing").await.unwrap().is_empty());

        assert_eq!(output.delete_all("songs").await.unwrap(), 2);
        assert!(output.list("songs").await.unwrap().is_empty());
        assert!(!dir.path().join("warehouse/songs").exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_directories_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputLocation::local(dir.path()).unwrap();
        let stale = output.path_for("time/year=2018/month=11/a.parquet");
        let live = output.path_for("time/year=2019/month=1/b.parquet");
        for path in [&stale, &live] {
            output
                .store()
                .put(path, Bytes::from_static(b"x").into())
                .await
                .unwrap();
        }
        output.delete_if_exists(&stale).await.unwrap();

        output.prune_empty_dirs("time").unwrap();

        assert!(!dir.path().join("time/year=2018").exists());
        assert!(dir.path().join("time/year=2019/month=1/b.parquet").exists());
        output.prune_empty_dirs("missing").unwrap();
    }
}
