pub mod s3;
pub mod workspaces;

use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::error::Result;

/// Entry type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

/// A listing entry as presented to the upstream application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub name: String,
    pub file_type: FileType,
    /// Size in bytes, unknown for directories
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    /// `Some(false)` pins the entry in place (containers, workspaces)
    pub can_move: Option<bool>,
}

impl Entry {
    pub fn file(name: impl Into<String>, size: u64, mtime: Option<SystemTime>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::File,
            size: Some(size),
            mtime,
            can_move: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Directory,
            size: None,
            mtime: None,
            can_move: None,
        }
    }

    pub fn with_mtime(mut self, mtime: Option<SystemTime>) -> Self {
        self.mtime = mtime;
        self
    }

    /// Mark the entry as not movable
    pub fn pinned(mut self) -> Self {
        self.can_move = Some(false);
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Per-path capability flags; `None` means no restriction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub can_create_file: Option<bool>,
    pub can_rename: Option<bool>,
    pub can_move: Option<bool>,
    pub can_upload: Option<bool>,
}

impl Capabilities {
    /// The root lists containers and is not a writable directory
    pub fn root() -> Self {
        Self {
            can_create_file: Some(false),
            can_rename: Some(false),
            can_move: Some(false),
            can_upload: Some(false),
        }
    }

    /// Capabilities for a path on a backend whose root is a container listing
    pub fn for_path(path: &str) -> Self {
        if path == "/" {
            Self::root()
        } else {
            Self::default()
        }
    }
}

/// Stream type for file content, in and out
pub type DataStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Uniform filesystem contract every backend satisfies
///
/// Backends are path-based and stateless between calls: each operation
/// receives an absolute upstream path. A trailing `/` marks a directory.
#[async_trait]
pub trait FilesystemBackend: Send + Sync {
    /// Capability flags for a path
    fn capabilities(&self, path: &str) -> Capabilities {
        Capabilities::for_path(path)
    }

    /// List a directory
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Open a file for reading
    async fn read(&self, path: &str) -> Result<DataStream>;

    /// Create a directory
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Delete a file, or a directory and everything below it
    async fn delete(&self, path: &str) -> Result<()>;

    /// Rename a file
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Create an empty file
    async fn touch(&self, path: &str) -> Result<()>;

    /// Store the content of `data` at `path`
    async fn write(&self, path: &str, data: DataStream) -> Result<()>;
}

/// Builds a backend on demand from a set of parameters.
///
/// The workspaces backend uses this to get a fresh object-store backend for
/// each operation, scoped to the credentials the management service handed
/// out.
#[async_trait]
pub trait BackendProvisioner: Send + Sync {
    async fn provision(&self, credentials: s3::S3Credentials) -> Result<Arc<dyn FilesystemBackend>>;
}

/// Wrap in-memory bytes as a single-chunk stream
pub fn stream_from_bytes(data: impl Into<Bytes>) -> DataStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Wrap a list of chunks as a stream
pub fn stream_from_chunks(chunks: Vec<Bytes>) -> DataStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}

/// Read a whole stream into memory
pub async fn collect(mut stream: DataStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_capabilities() {
        let caps = Capabilities::for_path("/");
        assert_eq!(caps.can_create_file, Some(false));
        assert_eq!(caps.can_rename, Some(false));
        assert_eq!(caps.can_move, Some(false));
        assert_eq!(caps.can_upload, Some(false));

        assert_eq!(Capabilities::for_path("/bucket/"), Capabilities::default());
    }

    #[test]
    fn test_entry_constructors() {
        let dir = Entry::directory("photos").pinned();
        assert!(dir.is_dir());
        assert_eq!(dir.size, None);
        assert_eq!(dir.can_move, Some(false));

        let file = Entry::file("a.txt", 12, None);
        assert!(!file.is_dir());
        assert_eq!(file.size, Some(12));
        assert_eq!(file.can_move, None);
    }

    #[tokio::test]
    async fn test_collect_chunks() {
        let stream = stream_from_chunks(vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]);
        assert_eq!(collect(stream).await.unwrap(), Bytes::from_static(b"hello world"));

        let stream = stream_from_bytes("single");
        assert_eq!(collect(stream).await.unwrap(), Bytes::from_static(b"single"));
    }
}
