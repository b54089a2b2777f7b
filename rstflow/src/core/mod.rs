//! Core domain model types for rstflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Radar identifier, time window and the combined artifact key
//! - Artifact status enum
//! - The artifact record itself

mod artifact;
mod key;
mod status;

pub use artifact::{file_checksum, Artifact};
pub use key::{ArtifactKey, KeyParseError, RadarId, TimeWindow};
pub use status::ArtifactStatus;
