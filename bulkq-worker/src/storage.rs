//! Blob storage seam
//!
//! Chunk files and the two JSON index files live in a flat blob store
//! addressed by file name. The trait keeps the pipeline independent of the
//! actual backend; the local implementation maps names onto a directory.

use async_trait::async_trait;
use bulkq_common::{Error, Result};
use std::path::{Path, PathBuf};

/// File-storage operations the pipeline depends on
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Whether a file with this name exists
    async fn has_file(&self, file_name: &str) -> Result<bool>;

    /// Read a file's content; `Error::NotFound` if it does not exist
    async fn get_file_content(&self, file_name: &str) -> Result<String>;

    /// Write (or overwrite) a file
    async fn write_to_storage(&self, content: &str, file_name: &str) -> Result<()>;

    /// Delete a file; deleting a missing file is not an error
    async fn delete_file(&self, file_name: &str) -> Result<()>;

    /// List file names starting with the given prefix
    async fn find_files(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed blob store rooted at a data directory
pub struct LocalFileManager {
    root: PathBuf,
}

impl LocalFileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if needed
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileManager for LocalFileManager {
    async fn has_file(&self, file_name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(file_name)).await?)
    }

    async fn get_file_content(&self, file_name: &str) -> Result<String> {
        match tokio::fs::read_to_string(self.path_for(file_name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("File not found: {}", file_name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_to_storage(&self, content: &str, file_name: &str) -> Result<()> {
        tokio::fs::write(self.path_for(file_name), content).await?;
        Ok(())
    }

    async fn delete_file(&self, file_name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(file_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
