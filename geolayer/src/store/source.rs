//! Range-addressable byte sources.
//!
//! Every physical read of the store goes through a [`RangeSource`]: a local
//! file, an in-memory buffer, or an HTTP(S) resource read with range
//! requests (see [`super::http`]).

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::http::{HttpRangeSource, HttpSourceConfig};
use super::StoreError;

/// A byte source supporting bounded reads at arbitrary offsets.
pub trait RangeSource: Send + Sync + fmt::Debug {
    /// Total length in bytes, known once the source is opened.
    fn len(&self) -> u64;

    /// Reads exactly `length` bytes starting at `offset`.
    fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>>;

    /// Human-readable location, used for logging and dataset identity.
    fn describe(&self) -> String;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_bounds(offset: u64, length: u64, total: u64) -> Result<(), StoreError> {
    match offset.checked_add(length) {
        Some(end) if end <= total => Ok(()),
        _ => Err(StoreError::Io(format!(
            "read of {} bytes at {} exceeds length {}",
            length, offset, total
        ))),
    }
}

// =============================================================================
// Local file
// =============================================================================

/// Positional reads from a local file on the blocking pool.
pub struct FileSource {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
    len: u64,
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let (file, len) = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&opened)?;
            let len = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, len))
        })
        .await
        .map_err(|e| StoreError::Io(format!("open task failed: {}", e)))??;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        Box::pin(async move {
            check_bounds(offset, length, self.len)?;
            let file = Arc::clone(&self.file);
            tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; length as usize];
                let mut guard = file.lock();
                guard.seek(SeekFrom::Start(offset))?;
                guard.read_exact(&mut buf)?;
                Ok::<_, std::io::Error>(Bytes::from(buf))
            })
            .await
            .map_err(|e| StoreError::Io(format!("read task failed: {}", e)))?
            .map_err(StoreError::from)
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// =============================================================================
// Memory
// =============================================================================

/// An in-memory source.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl RangeSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        Box::pin(async move {
            check_bounds(offset, length, self.len())?;
            Ok(self.data.slice(offset as usize..(offset + length) as usize))
        })
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Opens a source for a path or an `http(s)://` URL.
pub async fn open_source(
    location: &str,
    http: &HttpSourceConfig,
) -> Result<Arc<dyn RangeSource>, StoreError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Arc::new(HttpRangeSource::connect(location, http.clone()).await?))
    } else {
        Ok(Arc::new(FileSource::open(location).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_source_bounds() {
        let src = MemorySource::new("t", vec![1u8, 2, 3, 4]);
        assert_eq!(&src.read_range(1, 2).await.unwrap()[..], &[2, 3]);
        assert!(matches!(src.read_range(3, 2).await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_file_source_reads_range() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let src = FileSource::open(tmp.path()).await.unwrap();
        assert_eq!(src.len(), 10);
        assert_eq!(&src.read_range(4, 3).await.unwrap()[..], b"456");
        assert!(src.read_range(8, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = FileSource::open("/definitely/not/here.tif").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn test_open_source_dispatches_paths() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let src = open_source(tmp.path().to_str().unwrap(), &HttpSourceConfig::default())
            .await
            .unwrap();
        assert!(src.is_empty());
    }
}
