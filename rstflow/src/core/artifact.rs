//! Artifact type describing one produced file.

use super::{ArtifactKey, ArtifactStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// A concrete file produced by one stage for one radar and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The (radar, time window) key.
    #[serde(flatten)]
    pub key: ArtifactKey,

    /// The stage that produced the file.
    pub stage_name: String,

    /// Location of the file on disk.
    pub file_path: PathBuf,

    /// When the file was produced.
    pub created_at: DateTime<Utc>,

    /// SHA-256 of the file contents, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// File size in bytes at record time.
    #[serde(default)]
    pub size_bytes: u64,

    /// Whether the file is removed by `remove_temporary`.
    #[serde(default)]
    pub temporary: bool,

    /// Lifecycle status.
    pub status: ArtifactStatus,
}

impl Artifact {
    /// Creates a pending artifact for a file.
    #[must_use]
    pub fn new(key: ArtifactKey, stage_name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            key,
            stage_name: stage_name.into(),
            file_path: file_path.into(),
            created_at: Utc::now(),
            checksum: None,
            size_bytes: 0,
            temporary: false,
            status: ArtifactStatus::Pending,
        }
    }

    /// Marks the artifact as temporary.
    #[must_use]
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the size.
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Sets the checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Returns true if the artifact is Built.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.status.is_usable()
    }
}

/// Computes the hex-encoded SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
