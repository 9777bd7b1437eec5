use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::detect::{detect_format, SNIFF_WINDOW};
use super::parser::DocumentFormat;
use crate::blob::{BlobSink, BlobStore, StorageHandle};
use crate::evidence::{Classification, EvidenceItem};
use crate::pipeline::Stage;
use crate::storage::Storage;

/// Read size for streaming uploads.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("File is empty")]
    EmptyFile,
    #[error("Upload is missing an engagement")]
    MissingEngagement,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Failed to read upload: {0}")]
    Read(std::io::Error),
    #[error(transparent)]
    Storage(#[from] crate::Error),
}

pub type GateResult<T> = Result<T, GateError>;

/// Caller-supplied description of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub engagement_id: Uuid,
    pub file_name: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub classification: Classification,
    pub batch_id: Option<Uuid>,
}

impl Upload {
    #[must_use]
    pub fn new(engagement_id: Uuid, file_name: impl Into<String>) -> Self {
        Self {
            engagement_id,
            file_name: file_name.into(),
            content_type: None,
            classification: Classification::default(),
            batch_id: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub const fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    #[must_use]
    pub const fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    Stored(EvidenceItem),
    Duplicate {
        item: EvidenceItem,
        original: EvidenceItem,
    },
}

impl GateOutcome {
    #[must_use]
    pub const fn item(&self) -> &EvidenceItem {
        match self {
            Self::Stored(item) | Self::Duplicate { item, .. } => item,
        }
    }
}

/// Size, type and fingerprint checks plus durable storage for uploads.
#[derive(Clone)]
pub struct ValidationGate {
    storage: Storage,
    blobs: Arc<dyn BlobStore>,
    max_bytes: u64,
}

impl ValidationGate {
    #[must_use]
    pub fn new(storage: Storage, blobs: Arc<dyn BlobStore>, max_bytes: u64) -> Self {
        Self {
            storage,
            blobs,
            max_bytes,
        }
    }

    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Streams `reader` through the size ceiling, type sniffing and
    /// fingerprinting, then records the upload or links it to an earlier
    /// identical one. With a `size_hint` memory use is bounded by
    /// [`CHUNK_SIZE`]; without one the upload is held in memory, never past
    /// the ceiling, and only reaches the blob store once it fits.
    pub async fn admit<R>(
        &self,
        upload: &Upload,
        mut reader: R,
        size_hint: Option<u64>,
    ) -> GateResult<GateOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        if upload.engagement_id.is_nil() {
            return Err(ValidationError::MissingEngagement.into());
        }
        if let Some(size) = size_hint.filter(|size| *size > self.max_bytes) {
            return Err(self.too_large(size).into());
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let first = read_chunk(&mut reader, &mut buf).await.map_err(GateError::Read)?;
        if first == 0 {
            return Err(ValidationError::EmptyFile.into());
        }
        let mut size = first as u64;
        if size > self.max_bytes {
            return Err(self.too_large(size).into());
        }

        let declared = DocumentFormat::declared(&upload.file_name, upload.content_type.as_deref());
        let format = detect_format(&buf[..first.min(SNIFF_WINDOW)], declared)
            .map_err(ValidationError::UnsupportedFileType)?;

        let mut hasher = Sha256::new();
        hasher.update(&buf[..first]);
        // Without a declared length nothing is staged until the whole upload
        // is known to fit under the ceiling.
        let mut staging = match size_hint {
            Some(_) => Staging::Streaming(self.blobs.create(upload.engagement_id).await?),
            None => Staging::Held(Vec::with_capacity(first)),
        };
        if let Err(e) = staging.push(&buf[..first]).await {
            staging.discard().await;
            return Err(e.into());
        }

        loop {
            let n = match read_chunk(&mut reader, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    staging.discard().await;
                    return Err(GateError::Read(e));
                }
            };
            if n == 0 {
                break;
            }
            size += n as u64;
            if size > self.max_bytes {
                staging.discard().await;
                return Err(self.too_large(size).into());
            }
            hasher.update(&buf[..n]);
            if let Err(e) = staging.push(&buf[..n]).await {
                staging.discard().await;
                return Err(e.into());
            }
        }

        let fingerprint = hex::encode(hasher.finalize());
        let mut item = EvidenceItem::new(
            upload.engagement_id,
            upload.file_name.clone(),
            fingerprint,
            format.as_str().to_string(),
            size,
        );
        item.declared_type.clone_from(&upload.content_type);
        item.classification = upload.classification;

        if let Some(original) = self
            .storage
            .find_original(upload.engagement_id, &item.fingerprint)
            .await?
        {
            staging.discard().await;
            return self.link_duplicate(item, original).await;
        }

        let handle = staging.commit(self.blobs.as_ref(), upload.engagement_id).await?;
        item.storage = Some(handle.clone());

        match self.storage.insert_evidence(&item).await {
            Ok(()) => {
                tracing::info!(
                    evidence_id = %item.id,
                    engagement_id = %item.engagement_id,
                    format = %format,
                    size,
                    "Stored evidence"
                );
                Ok(GateOutcome::Stored(item))
            }
            Err(crate::Error::DuplicateFingerprint { .. }) => {
                // A concurrent upload of the same bytes won the race.
                self.blobs.delete(&handle).await?;
                item.storage = None;
                let original = self
                    .storage
                    .find_original(item.engagement_id, &item.fingerprint)
                    .await?
                    .ok_or(crate::Error::EvidenceNotFound(item.id))?;
                self.link_duplicate(item, original).await
            }
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&handle).await {
                    tracing::warn!("Failed to remove orphaned blob: {}", cleanup);
                }
                Err(e.into())
            }
        }
    }

    async fn link_duplicate(
        &self,
        mut item: EvidenceItem,
        original: EvidenceItem,
    ) -> GateResult<GateOutcome> {
        item.duplicate_of = Some(original.id);
        item.stage = Stage::Duplicate;
        item.storage = None;
        self.storage.insert_evidence(&item).await?;

        tracing::info!(
            evidence_id = %item.id,
            duplicate_of = %original.id,
            "Linked duplicate upload"
        );
        Ok(GateOutcome::Duplicate { item, original })
    }

    const fn too_large(&self, size: u64) -> ValidationError {
        ValidationError::FileTooLarge {
            size,
            limit: self.max_bytes,
        }
    }
}

/// Where admitted bytes go before the upload is committed.
enum Staging {
    /// Size unknown up front; bounded by the gate's ceiling.
    Held(Vec<u8>),
    Streaming(Box<dyn BlobSink>),
}

impl Staging {
    async fn push(&mut self, chunk: &[u8]) -> crate::Result<()> {
        match self {
            Self::Held(held) => {
                held.extend_from_slice(chunk);
                Ok(())
            }
            Self::Streaming(sink) => sink.write_chunk(chunk).await,
        }
    }

    async fn commit(self, blobs: &dyn BlobStore, engagement_id: Uuid) -> crate::Result<StorageHandle> {
        let sink = match self {
            Self::Streaming(sink) => sink,
            Self::Held(held) => {
                let mut sink = blobs.create(engagement_id).await?;
                for chunk in held.chunks(CHUNK_SIZE) {
                    if let Err(e) = sink.write_chunk(chunk).await {
                        Self::Streaming(sink).discard().await;
                        return Err(e);
                    }
                }
                sink
            }
        };
        sink.commit().await
    }

    async fn discard(self) {
        if let Self::Streaming(sink) = self {
            if let Err(e) = sink.abort().await {
                tracing::warn!("Failed to discard staged upload: {}", e);
            }
        }
    }
}

/// Fills `buf` unless the reader runs dry first.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;

    async fn gate(max_bytes: u64) -> (tempfile::TempDir, ValidationGate, Storage) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open_memory().await.unwrap();
        let blobs = FsBlobStore::open(tmp.path()).await.unwrap();
        let gate = ValidationGate::new(storage.clone(), Arc::new(blobs), max_bytes);
        (tmp, gate, storage)
    }

    fn stored_blob_count(root: &std::path::Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| std::fs::read_dir(e.path()).map_or(0, Iterator::count))
            .sum()
    }

    #[tokio::test]
    async fn test_admits_text_and_fingerprints() {
        let (tmp, gate, storage) = gate(1024).await;
        let upload = Upload::new(Uuid::now_v7(), "notes.txt");

        let outcome = gate.admit(&upload, &b"hello"[..], Some(5)).await.unwrap();
        let GateOutcome::Stored(item) = outcome else {
            panic!("expected stored");
        };

        assert_eq!(
            item.fingerprint,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(item.detected_format, "plain_text");
        assert!(item.has_blob());
        assert_eq!(storage.get_evidence(item.id).await.unwrap().size_bytes, 5);
        assert_eq!(stored_blob_count(tmp.path()), 1);
    }

    #[tokio::test]
    async fn test_oversized_rejected_before_any_write() {
        let (tmp, gate, storage) = gate(16).await;
        let engagement = Uuid::now_v7();
        let upload = Upload::new(engagement, "big.txt");
        let body = vec![b'a'; 1000];

        let err = gate.admit(&upload, &body[..], None).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Validation(ValidationError::FileTooLarge { limit: 16, .. })
        ));
        assert!(storage.list_evidence(engagement).await.unwrap().is_empty());
        assert_eq!(stored_blob_count(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_oversized_stream_crossing_limit_late() {
        let (tmp, gate, _storage) = gate(CHUNK_SIZE as u64 + 10).await;
        let upload = Upload::new(Uuid::now_v7(), "big.txt");
        let body = vec![b'a'; CHUNK_SIZE * 2];

        let err = gate.admit(&upload, &body[..], None).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Validation(ValidationError::FileTooLarge { .. })
        ));
        assert_eq!(stored_blob_count(tmp.path()), 0);
        let staged = std::fs::read_dir(tmp.path().join(".staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    /// Counts every chunk that reaches a sink.
    struct CountingBlobs {
        inner: FsBlobStore,
        chunks: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct CountingSink {
        inner: Box<dyn BlobSink>,
        chunks: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BlobStore for CountingBlobs {
        async fn create(&self, engagement_id: Uuid) -> crate::Result<Box<dyn BlobSink>> {
            Ok(Box::new(CountingSink {
                inner: self.inner.create(engagement_id).await?,
                chunks: Arc::clone(&self.chunks),
            }))
        }

        async fn read(&self, handle: &StorageHandle) -> crate::Result<Vec<u8>> {
            self.inner.read(handle).await
        }

        async fn delete(&self, handle: &StorageHandle) -> crate::Result<()> {
            self.inner.delete(handle).await
        }

        async fn delete_engagement(&self, engagement_id: Uuid) -> crate::Result<()> {
            self.inner.delete_engagement(engagement_id).await
        }
    }

    #[async_trait::async_trait]
    impl BlobSink for CountingSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> crate::Result<()> {
            self.chunks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.write_chunk(chunk).await
        }

        async fn commit(self: Box<Self>) -> crate::Result<StorageHandle> {
            self.inner.commit().await
        }

        async fn abort(self: Box<Self>) -> crate::Result<()> {
            self.inner.abort().await
        }
    }

    #[tokio::test]
    async fn test_unsized_stream_writes_nothing_until_it_fits() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open_memory().await.unwrap();
        let chunks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let blobs = CountingBlobs {
            inner: FsBlobStore::open(tmp.path()).await.unwrap(),
            chunks: Arc::clone(&chunks),
        };
        let gate = ValidationGate::new(storage, Arc::new(blobs), CHUNK_SIZE as u64 * 2 + 10);
        let upload = Upload::new(Uuid::now_v7(), "big.txt");

        let over = vec![b'a'; CHUNK_SIZE * 3];
        let err = gate.admit(&upload, &over[..], None).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Validation(ValidationError::FileTooLarge { .. })
        ));
        assert_eq!(chunks.load(std::sync::atomic::Ordering::SeqCst), 0);

        let fits = vec![b'b'; CHUNK_SIZE * 2];
        let outcome = gate.admit(&upload, &fits[..], None).await.unwrap();
        assert_eq!(outcome.item().size_bytes, CHUNK_SIZE as u64 * 2);
        assert_eq!(chunks.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(stored_blob_count(tmp.path()), 1);
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let (_tmp, gate, _storage) = gate(1024).await;
        let upload = Upload::new(Uuid::now_v7(), "photo.jpg");

        let err = gate
            .admit(&upload, &[0xFF, 0xD8, 0xFF, 0xE0, 0x00][..], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::Validation(ValidationError::UnsupportedFileType(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_is_linked_without_blob() {
        let (tmp, gate, _storage) = gate(1024).await;
        let engagement = Uuid::now_v7();

        let first = gate
            .admit(&Upload::new(engagement, "a.txt"), &b"same bytes"[..], None)
            .await
            .unwrap();
        let second = gate
            .admit(&Upload::new(engagement, "b.txt"), &b"same bytes"[..], None)
            .await
            .unwrap();

        let GateOutcome::Duplicate { item, original } = second else {
            panic!("expected duplicate");
        };
        assert_eq!(original.id, first.item().id);
        assert_eq!(item.duplicate_of, Some(original.id));
        assert_eq!(item.stage, Stage::Duplicate);
        assert!(!item.has_blob());
        assert_eq!(stored_blob_count(tmp.path()), 1);
    }

    #[tokio::test]
    async fn test_same_bytes_in_other_engagement_is_not_duplicate() {
        let (_tmp, gate, _storage) = gate(1024).await;

        gate.admit(&Upload::new(Uuid::now_v7(), "a.txt"), &b"shared"[..], None)
            .await
            .unwrap();
        let other = gate
            .admit(&Upload::new(Uuid::now_v7(), "a.txt"), &b"shared"[..], None)
            .await
            .unwrap();
        assert!(matches!(other, GateOutcome::Stored(_)));
    }

    #[tokio::test]
    async fn test_nil_engagement_rejected() {
        let (_tmp, gate, _storage) = gate(1024).await;
        let err = gate
            .admit(&Upload::new(Uuid::nil(), "a.txt"), &b"x"[..], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::Validation(ValidationError::MissingEngagement)
        ));
    }
}
