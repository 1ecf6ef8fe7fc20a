use crate::BundleRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lazy byte sequence flowing from a protocol manager into a sink.
pub type ByteStream = futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>;

/// A one-chunk stream over bytes already in memory.
pub fn bytes_stream(data: impl Into<bytes::Bytes>) -> ByteStream {
    Box::pin(futures::stream::iter(std::iter::once(Ok(data.into()))))
}

/// Descriptor of one resource written into a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub url: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ResourceMeta {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            content_type: None,
            headers: BTreeMap::new(),
            note: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode bundle metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Destination for fetched bundles.
///
/// `open_bundle` scopes one bundle's writes; the returned context must be
/// `close`d to finalize the artifact. A context dropped without `close`
/// abandons the bundle: temp state is removed and no terminal metadata is
/// written.
#[async_trait::async_trait]
pub trait StorageSink: Send + Sync {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError>;
}

#[async_trait::async_trait]
pub trait BundleContext: Send {
    /// Consume `stream` fully and persist it under `resource`. Resources are
    /// written in call order.
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        stream: ByteStream,
    ) -> Result<(), StorageError>;

    /// Finalize the bundle, returning the reference with `resources_count`
    /// and `storage_key` filled in.
    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError>;
}
