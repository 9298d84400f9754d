//! Flowcache Artifact
//!
//! This crate provides the blob storage trait and implementations used to
//! persist serialized task results. A result lives at a [`BlobLocation`]
//! (store identifier plus object key) that is allocated when the cache row is
//! created and recorded on that row.
//!
//! The [`Store`] trait defines the platform/backend layer for blob storage.
//! Implementations handle the actual storage (filesystem, memory, object
//! storage gateways) while the runtime decides which location a result uses.
//!
//! The trait uses async streaming for efficient handling of large results.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// A boxed stream of bytes for blob data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested blob was not found.
  #[error("blob not found: {0}")]
  NotFound(BlobLocation),

  /// The location cannot be mapped onto this backend.
  #[error("invalid blob location {location}: {message}")]
  InvalidLocation {
    location: BlobLocation,
    message: String,
  },

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Where a serialized result is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
  /// Identifier of the storage backend/bucket.
  pub store_id: String,
  /// Object key within the store.
  pub object_key: String,
}

impl BlobLocation {
  pub fn new(store_id: impl Into<String>, object_key: impl Into<String>) -> Self {
    Self {
      store_id: store_id.into(),
      object_key: object_key.into(),
    }
  }
}

impl fmt::Display for BlobLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.store_id, self.object_key)
  }
}

/// Blob storage trait.
///
/// Implementations provide the actual storage backend (filesystem, S3, etc.).
/// The runtime is responsible for allocating locations.
#[async_trait]
pub trait Store: Send + Sync {
  /// Retrieve a blob.
  ///
  /// Returns a stream of bytes for efficient handling of large results.
  async fn get(&self, location: &BlobLocation) -> Result<ByteStream, Error>;

  /// Store a blob, replacing any previous content at the same location.
  async fn put(
    &self,
    location: &BlobLocation,
    data: ByteStream,
    content_type: &str,
  ) -> Result<(), Error>;

  /// Delete a blob.
  async fn delete(&self, location: &BlobLocation) -> Result<(), Error>;
}

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
  let data = data.into();
  Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a [`ByteStream`] into a contiguous buffer.
pub async fn collect(mut stream: ByteStream) -> Result<Bytes, Error> {
  let mut buf = BytesMut::new();
  while let Some(chunk) = stream.next().await {
    buf.extend_from_slice(&chunk?);
  }
  Ok(buf.freeze())
}

/// Upload a buffer in one call. Returns the number of bytes written.
pub async fn upload(
  store: &dyn Store,
  location: &BlobLocation,
  data: Bytes,
  content_type: &str,
) -> Result<u64, Error> {
  let size = data.len() as u64;
  store
    .put(location, stream_from_bytes(data), content_type)
    .await?;
  Ok(size)
}

/// Download a blob fully into memory.
pub async fn download(store: &dyn Store, location: &BlobLocation) -> Result<Bytes, Error> {
  collect(store.get(location).await?).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_collect_joins_chunks() {
    let chunks = vec![Ok(Bytes::from_static(b"hel")), Ok(Bytes::from_static(b"lo"))];
    let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
    let data = collect(stream).await.unwrap();
    assert_eq!(&data[..], b"hello");
  }

  #[test]
  fn test_location_display() {
    let location = BlobLocation::new("local", "task-cache/abc.json");
    assert_eq!(location.to_string(), "local/task-cache/abc.json");
  }
}
