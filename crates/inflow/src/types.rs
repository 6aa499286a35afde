//! Data shared between the scanner, dispatcher and writers.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::writer::LoadMode;

/// Identity of a watched file: the directory it was found in plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileStamp {
    pub dir: PathBuf,
    pub file: String,
}

impl FileStamp {
    pub fn new(dir: impl Into<PathBuf>, file: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file: file.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }

    /// File name without its last extension, and the extension with its dot.
    pub fn split_name(&self) -> (&str, &str) {
        match self.file.rfind('.') {
            Some(idx) if idx > 0 => (&self.file[..idx], &self.file[idx..]),
            _ => (self.file.as_str(), ""),
        }
    }
}

impl fmt::Display for FileStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// The stat fields used to decide whether a file is still being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Birth time; `None` on filesystems that do not record it.
    pub created: Option<SystemTime>,
}

impl FileSignature {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            size: meta.len(),
            modified: meta.modified().ok(),
            created: meta.created().ok(),
        }
    }

    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&meta))
    }
}

/// A stable file handed from the scanner to the dispatcher and then to one writer.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub stamp: FileStamp,
    /// Stat snapshot taken when the file was promoted.
    pub signature: FileSignature,
    pub mode: LoadMode,
    /// Caller statement text appended after the bound preamble.
    pub statement: Arc<str>,
    /// Destination root for loaded files; `None` deletes them.
    pub success_path: Option<PathBuf>,
    /// Destination root for failed files; `None` deletes them.
    pub error_path: Option<PathBuf>,
}

/// Counters reported with every digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestCounts {
    pub success: u64,
    pub error: u64,
    pub queue: u64,
}

impl fmt::Display for DigestCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success load {} file(s), error load {} file(s), queue {}",
            self.success, self.error, self.queue
        )
    }
}
