//! Artifact status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// The producing stage has been scheduled but not finished.
    #[default]
    Pending,
    /// The file exists and reflects its current inputs.
    Built,
    /// The producing stage failed.
    Failed,
    /// An upstream artifact changed; the file must be rebuilt before reuse.
    Stale,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Built => write!(f, "built"),
            Self::Failed => write!(f, "failed"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

impl ArtifactStatus {
    /// Returns true if the artifact can be consumed by a downstream stage.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ArtifactStatus::Built.to_string(), "built");
        assert_eq!(ArtifactStatus::Stale.to_string(), "stale");
        assert_eq!(ArtifactStatus::default(), ArtifactStatus::Pending);
    }

    #[test]
    fn test_status_usable() {
        assert!(ArtifactStatus::Built.is_usable());
        assert!(!ArtifactStatus::Stale.is_usable());
        assert!(!ArtifactStatus::Failed.is_usable());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&ArtifactStatus::Stale).unwrap();
        assert_eq!(json, r#""stale""#);
    }
}
