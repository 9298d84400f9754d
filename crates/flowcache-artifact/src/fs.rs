use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{BlobLocation, ByteStream, Error, Store};

/// Filesystem-based blob store.
///
/// Stores blobs as files on the local filesystem. Each blob is stored at
/// `{base_path}/{store_id}/{object_key}`. Parent directories are created
/// automatically. Writes go to a sibling temp file that is renamed into place,
/// so a reader never observes a partially written result.
pub struct FsStore {
  base_path: PathBuf,
}

impl FsStore {
  /// Create a new filesystem store with the given base path.
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  /// Get the base directory of the store.
  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn location_to_path(&self, location: &BlobLocation) -> Result<PathBuf, Error> {
    for part in [&location.store_id, &location.object_key] {
      let escapes = Path::new(part)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
      if part.is_empty() || escapes {
        return Err(Error::InvalidLocation {
          location: location.clone(),
          message: "must be a non-empty relative path without '..'".to_string(),
        });
      }
    }
    Ok(
      self
        .base_path
        .join(&location.store_id)
        .join(&location.object_key),
    )
  }
}

fn not_found_or_io(location: &BlobLocation, e: std::io::Error) -> Error {
  if e.kind() == std::io::ErrorKind::NotFound {
    Error::NotFound(location.clone())
  } else {
    Error::Io(e)
  }
}

#[async_trait]
impl Store for FsStore {
  async fn get(&self, location: &BlobLocation) -> Result<ByteStream, Error> {
    let path = self.location_to_path(location)?;
    let file = File::open(&path)
      .await
      .map_err(|e| not_found_or_io(location, e))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn put(
    &self,
    location: &BlobLocation,
    data: ByteStream,
    _content_type: &str,
  ) -> Result<(), Error> {
    let path = self.location_to_path(location)?;

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".partial");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path).await?;
    let mut stream = std::pin::pin!(data);

    while let Some(chunk) = stream.next().await {
      let bytes = match chunk {
        Ok(bytes) => bytes,
        Err(e) => {
          let _ = fs::remove_file(&tmp_path).await;
          return Err(e);
        }
      };
      file.write_all(&bytes).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, &path).await?;
    Ok(())
  }

  async fn delete(&self, location: &BlobLocation) -> Result<(), Error> {
    let path = self.location_to_path(location)?;
    fs::remove_file(&path)
      .await
      .map_err(|e| not_found_or_io(location, e))
  }
}
