use std::path::{Path, PathBuf};

use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Chunked byte stream over an asset, for response bodies.
pub type AssetStream = ReaderStream<Box<dyn AsyncRead + Send + Unpin>>;

/// What an asset is, which decides the root it lives under: raw uploads in
/// the uploaded-videos root, timelines and rendered copies in the processed
/// root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Raw,
    Timeline,
    Rendered,
}

impl AssetKind {
    /// Key for a job's asset of this kind.
    pub fn key(self, job_id: Uuid, ext: &str) -> String {
        format!("{job_id}.{ext}")
    }

    fn prefix(self) -> &'static str {
        match self {
            AssetKind::Raw => "raw",
            AssetKind::Timeline | AssetKind::Rendered => "processed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Filesystem-backed store over the two shared volumes. Writes land in a
/// temp sibling and are renamed into place, so a key is either absent or
/// complete — readers never observe partial bytes.
pub struct LocalStore {
    uploaded_root: PathBuf,
    processed_root: PathBuf,
}

impl LocalStore {
    pub fn new(uploaded_root: &str, processed_root: &str) -> Result<Self, StorageError> {
        let uploaded_root = PathBuf::from(uploaded_root);
        let processed_root = PathBuf::from(processed_root);
        std::fs::create_dir_all(&uploaded_root)?;
        std::fs::create_dir_all(&processed_root)?;
        Ok(Self {
            uploaded_root,
            processed_root,
        })
    }

    fn root(&self, kind: AssetKind) -> &Path {
        match kind {
            AssetKind::Raw => &self.uploaded_root,
            AssetKind::Timeline | AssetKind::Rendered => &self.processed_root,
        }
    }

    fn path_for(&self, kind: AssetKind, key: &str) -> PathBuf {
        self.root(kind).join(key)
    }

    async fn put(&self, kind: AssetKind, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let dest = self.path_for(kind, key);
        let tmp = self
            .root(kind)
            .join(format!(".{key}.tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        match tokio::fs::rename(&tmp, &dest).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    async fn get(&self, kind: AssetKind, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(kind, key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, kind: AssetKind, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(kind, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stream(&self, kind: AssetKind, key: &str) -> Result<AssetStream, StorageError> {
        match tokio::fs::File::open(self.path_for(kind, key)).await {
            Ok(file) => Ok(ReaderStream::new(
                Box::new(file) as Box<dyn AsyncRead + Send + Unpin>
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn health_check(&self) -> Result<(), StorageError> {
        for root in [&self.uploaded_root, &self.processed_root] {
            let meta = std::fs::metadata(root)?;
            if !meta.is_dir() {
                return Err(StorageError::Config(format!(
                    "storage root {} is not a directory",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

/// S3-compatible store (single bucket, `raw/` and `processed/` prefixes).
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn object_path(kind: AssetKind, key: &str) -> String {
        format!("{}/{}", kind.prefix(), key)
    }

    async fn put(&self, kind: AssetKind, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.bucket
            .put_object(Self::object_path(kind, key), data)
            .await?;
        Ok(())
    }

    async fn get(&self, kind: AssetKind, key: &str) -> Result<Vec<u8>, StorageError> {
        match self.bucket.get_object(Self::object_path(kind, key)).await {
            Ok(response) => Ok(response.to_vec()),
            Err(S3Error::HttpFailWithBody(404, _)) => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, kind: AssetKind, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(Self::object_path(kind, key)).await {
            Ok(_) => Ok(()),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        match self.bucket.head_object("health").await {
            Ok(_) => Ok(()),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The Storage Layer behind stable identifiers: jobs reference assets only
/// through keys, so the backing store can move without registry changes.
pub enum AssetStore {
    Local(LocalStore),
    S3(S3Store),
}

impl AssetStore {
    /// Build the store selected by `STORAGE_BACKEND`.
    pub fn from_config(config: &crate::config::AppConfig) -> Result<Self, StorageError> {
        match config.storage_backend.as_str() {
            "local" => Ok(AssetStore::Local(LocalStore::new(
                &config.uploaded_videos_dir,
                &config.processed_videos_dir,
            )?)),
            "s3" => {
                let require = |value: &Option<String>, name: &str| {
                    value.as_deref().map(str::to_string).ok_or_else(|| {
                        StorageError::Config(format!("{name} is required when STORAGE_BACKEND=s3"))
                    })
                };
                let store = S3Store::new(
                    &require(&config.s3_bucket, "S3_BUCKET")?,
                    &require(&config.s3_endpoint, "S3_ENDPOINT")?,
                    &require(&config.s3_access_key, "S3_ACCESS_KEY")?,
                    &require(&config.s3_secret_key, "S3_SECRET_KEY")?,
                )?;
                Ok(AssetStore::S3(store))
            }
            other => Err(StorageError::Config(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }

    /// Store an asset. Visible to readers only once complete.
    pub async fn put(&self, kind: AssetKind, key: &str, data: &[u8]) -> Result<(), StorageError> {
        match self {
            AssetStore::Local(store) => store.put(kind, key, data).await,
            AssetStore::S3(store) => store.put(kind, key, data).await,
        }
    }

    pub async fn get(&self, kind: AssetKind, key: &str) -> Result<Vec<u8>, StorageError> {
        match self {
            AssetStore::Local(store) => store.get(kind, key).await,
            AssetStore::S3(store) => store.get(kind, key).await,
        }
    }

    /// Idempotent: deleting a missing asset succeeds.
    pub async fn delete(&self, kind: AssetKind, key: &str) -> Result<(), StorageError> {
        match self {
            AssetStore::Local(store) => store.delete(kind, key).await,
            AssetStore::S3(store) => store.delete(kind, key).await,
        }
    }

    /// Chunked read for serving large assets. The local backend streams
    /// straight from disk; the S3 backend fetches the object first and
    /// chunks it out.
    pub async fn get_stream(&self, kind: AssetKind, key: &str) -> Result<AssetStream, StorageError> {
        match self {
            AssetStore::Local(store) => store.get_stream(kind, key).await,
            AssetStore::S3(store) => {
                let bytes = store.get(kind, key).await?;
                Ok(ReaderStream::new(Box::new(std::io::Cursor::new(bytes))
                    as Box<dyn AsyncRead + Send + Unpin>))
            }
        }
    }

    pub async fn health_check(&self) -> Result<(), StorageError> {
        match self {
            AssetStore::Local(store) => store.health_check(),
            AssetStore::S3(store) => store.health_check().await,
        }
    }
}
