//! File store backed by a local directory

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use linkchat_core::{FileDescriptor, LinkchatError, LinkchatResult};
use linkchat_runtime::{BoxedReader, BoxedWriter, FileStore};
use tracing::debug;

/// Stores pictures and attachments under `<root>/users/..` and `<root>/chats/..`
#[derive(Debug, Clone)]
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a file. Names coming from peers must not escape
    /// their folder.
    pub fn path_of(&self, descriptor: &FileDescriptor) -> LinkchatResult<PathBuf> {
        let name = descriptor.file_name.as_str();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(LinkchatError::not_permitted(format!(
                "invalid file name {:?}",
                name
            )));
        }
        Ok(self.root.join(descriptor.relative_path()))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn size(&self, descriptor: &FileDescriptor) -> LinkchatResult<Option<u64>> {
        let path = self.path_of(descriptor)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(
        &self,
        descriptor: &FileDescriptor,
    ) -> LinkchatResult<Option<(BoxedReader, u64)>> {
        let path = self.path_of(descriptor)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(Some((Box::new(file) as BoxedReader, size)))
    }

    async fn create(&self, descriptor: &FileDescriptor) -> LinkchatResult<BoxedWriter> {
        let path = self.path_of(descriptor)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!("Writing {}", path.display());
        Ok(Box::new(tokio::fs::File::create(&path).await?))
    }

    async fn discard(&self, descriptor: &FileDescriptor) -> LinkchatResult<()> {
        let path = self.path_of(descriptor)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
