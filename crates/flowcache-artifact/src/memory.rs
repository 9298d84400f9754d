use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::{BlobLocation, ByteStream, Error, Store, collect, stream_from_bytes};

/// In-memory blob store.
///
/// Suitable for tests and single-process use. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  blobs: Arc<DashMap<BlobLocation, Bytes>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether a blob exists at `location`.
  pub fn contains(&self, location: &BlobLocation) -> bool {
    self.blobs.contains_key(location)
  }

  /// Number of stored blobs.
  pub fn len(&self) -> usize {
    self.blobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blobs.is_empty()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn get(&self, location: &BlobLocation) -> Result<ByteStream, Error> {
    let data = self
      .blobs
      .get(location)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| Error::NotFound(location.clone()))?;
    Ok(stream_from_bytes(data))
  }

  async fn put(
    &self,
    location: &BlobLocation,
    data: ByteStream,
    _content_type: &str,
  ) -> Result<(), Error> {
    let data = collect(data).await?;
    self.blobs.insert(location.clone(), data);
    Ok(())
  }

  async fn delete(&self, location: &BlobLocation) -> Result<(), Error> {
    self
      .blobs
      .remove(location)
      .map(|_| ())
      .ok_or_else(|| Error::NotFound(location.clone()))
  }
}
