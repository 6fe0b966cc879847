use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{ChangeError, Result};

/// Resolves an opaque uploaded-file id to its bytes.
pub trait BlobStore: Send + Sync {
    fn open(&self, file_id: &str) -> Result<Box<dyn Read + Send>>;
}

/// Files stored flat in one directory, named by their id.
#[derive(Debug, Clone)]
pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Ids are plain file names; anything that could walk out of the directory is refused.
fn is_safe_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && !file_id.starts_with('.')
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl BlobStore for DirectoryBlobStore {
    fn open(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
        if !is_safe_id(file_id) {
            return Err(ChangeError::FileNotFound(file_id.to_string()));
        }
        match File::open(self.root.join(file_id)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ChangeError::FileNotFound(file_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .expect("blob store lock poisoned")
            .insert(file_id.into(), bytes.into());
    }
}

impl BlobStore for MemoryBlobStore {
    fn open(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
        let files = self.files.lock().expect("blob store lock poisoned");
        let bytes = files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ChangeError::FileNotFound(file_id.to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}
