use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::KvStore;
use crate::error::{Error, Result};

/// Stores each key in its own file, `<dir>/kv_<key>`
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".to_string()));
        }
        if key.contains(['/', '\\', '\0']) || key.contains("..") {
            return Err(Error::InvalidKey(format!("key {key:?} is not a plain name")));
        }
        Ok(self.dir.join(format!("kv_{key}")))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::write(&path, value).await?;
        tracing::debug!(path = %path.display(), "value written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
