//! Download directory: one file per completed block, plus the reassembled file.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_path(&self, block_id: u32) -> PathBuf {
        self.dir.join(format!("block_{block_id}.blk"))
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(sanitize_filename(name))
    }

    pub async fn write_block(&self, block_id: u32, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.block_path(block_id);
        self.write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_file(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.file_path(name);
        self.write(&path, bytes).await?;
        Ok(path)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(path, bytes).await
    }
}

/// Replace path separators so a descriptor name cannot escape the download directory.
pub fn sanitize_filename(name: &str) -> String {
    let safe = name.replace(['/', '\\'], "_");
    if safe.trim().is_empty() || safe == "." || safe == ".." {
        "download".to_string()
    } else {
        safe
    }
}
