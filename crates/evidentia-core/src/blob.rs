use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{Error, Result};

const SALT_FILE: &str = ".salt";
const STAGING_DIR: &str = ".staging";

/// Opaque reference to a stored blob. Only the blob store can resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle(String);

impl StorageHandle {
    pub(crate) fn from_stored(raw: String) -> Result<Self> {
        let (scope, id) = raw
            .split_once('/')
            .ok_or_else(|| Error::invalid("storage_handle", raw.as_str()))?;
        let scope_ok = scope.len() == 64 && scope.bytes().all(|b| b.is_ascii_hexdigit());
        if !scope_ok || Uuid::parse_str(id).is_err() {
            return Err(Error::invalid("storage_handle", raw.as_str()));
        }
        Ok(Self(raw))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

/// Durable storage for raw upload bytes, scoped per engagement.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens a write that only becomes visible on [`BlobSink::commit`].
    async fn create(&self, engagement_id: Uuid) -> Result<Box<dyn BlobSink>>;

    async fn read(&self, handle: &StorageHandle) -> Result<Vec<u8>>;

    /// Removing a missing blob is not an error.
    async fn delete(&self, handle: &StorageHandle) -> Result<()>;

    async fn delete_engagement(&self, engagement_id: Uuid) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BlobSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<StorageHandle>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Filesystem blob store.
///
/// Blobs live at `<root>/<scope>/<uuid>` where `scope` is a salted hash of
/// the engagement id. The salt is generated once per root and never leaves
/// the store, so paths cannot be derived from an engagement id.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    salt: Vec<u8>,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;

        let salt_path = root.join(SALT_FILE);
        let salt = match tokio::fs::read_to_string(&salt_path).await {
            Ok(existing) => hex::decode(existing.trim())
                .map_err(|_| Error::invalid("blob salt", salt_path.display().to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = Uuid::new_v4().as_bytes().to_vec();
                salt.extend_from_slice(Uuid::new_v4().as_bytes());
                tokio::fs::write(&salt_path, hex::encode(&salt)).await?;
                salt
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { root, salt })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope(&self, engagement_id: Uuid) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(engagement_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn resolve(&self, handle: &StorageHandle) -> PathBuf {
        // Handles are validated on construction, so both parts are plain names.
        let (scope, id) = handle.0.split_once('/').unwrap_or_default();
        self.root.join(scope).join(id)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn create(&self, engagement_id: Uuid) -> Result<Box<dyn BlobSink>> {
        let id = Uuid::new_v4();
        let temp_path = self.root.join(STAGING_DIR).join(format!("{id}.part"));
        let file = tokio::fs::File::create(&temp_path).await?;
        let scope = self.scope(engagement_id);

        Ok(Box::new(FsBlobSink {
            file: Some(file),
            temp_path,
            final_dir: self.root.join(&scope),
            handle: format!("{scope}/{id}"),
            id,
            finished: false,
        }))
    }

    async fn read(&self, handle: &StorageHandle) -> Result<Vec<u8>> {
        match tokio::fs::read(self.resolve(handle)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(handle.0.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        ignore_missing(tokio::fs::remove_file(self.resolve(handle)).await)
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> Result<()> {
        ignore_missing(tokio::fs::remove_dir_all(self.root.join(self.scope(engagement_id))).await)
    }
}

struct FsBlobSink {
    file: Option<tokio::fs::File>,
    temp_path: PathBuf,
    final_dir: PathBuf,
    handle: String,
    id: Uuid,
    finished: bool,
}

#[async_trait::async_trait]
impl BlobSink for FsBlobSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::invalid("blob sink", "already closed"))?;
        file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<StorageHandle> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::create_dir_all(&self.final_dir).await?;
        tokio::fs::rename(&self.temp_path, self.final_dir.join(self.id.to_string())).await?;
        self.finished = true;
        Ok(StorageHandle(std::mem::take(&mut self.handle)))
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.file.take();
        self.finished = true;
        ignore_missing(tokio::fs::remove_file(&self.temp_path).await)
    }
}

impl Drop for FsBlobSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

fn ignore_missing(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
