//! Kernel IR file input

use std::path::{Path, PathBuf};

/// Default IR file, looked up in the working directory
pub const DEFAULT_PTX_PATH: &str = "test.ptx";

/// Contents of an IR file, read in binary mode
///
/// The bytes are an opaque blob: nothing here checks that they are PTX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFile {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl IrFile {
    /// Read the whole file at `path`
    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        tracing::debug!(path = %path.display(), len = bytes.len(), "read IR file");
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
