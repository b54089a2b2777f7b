//! On-disk layout of artifacts.
//!
//! `<output_dir>/<radar>/<YYYYMMDD.HHMM>.<stage>.<ext>`, with in-progress
//! attempts written next to the final file under a `.partial-<uuid>` suffix.

use crate::core::{ArtifactKey, TimeWindow};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Marker embedded in staging file names.
pub const STAGING_MARKER: &str = ".partial-";

/// Length of the `YYYYMMDD.HHMM` prefix.
const SLUG_LEN: usize = 13;

/// Anchors a relative `path` at the current directory.
///
/// Tool processes run in their own working directory, so paths handed to
/// them must not depend on ours.
#[must_use]
pub fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Returns the final file name of an artifact.
#[must_use]
pub fn artifact_file_name(key: &ArtifactKey, stage: &str, extension: &str) -> String {
    format!("{}.{stage}.{extension}", key.time_window.slug())
}

/// Returns the final path of an artifact under `output_dir`.
#[must_use]
pub fn artifact_path(output_dir: &Path, key: &ArtifactKey, stage: &str, extension: &str) -> PathBuf {
    output_dir
        .join(key.radar_id.as_str())
        .join(artifact_file_name(key, stage, extension))
}

/// Returns a fresh staging path next to `final_path`.
#[must_use]
pub fn staging_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}{STAGING_MARKER}{}", Uuid::new_v4().simple()))
}

/// Returns true for staging files left behind by an attempt.
#[must_use]
pub fn is_staging_file(file_name: &str) -> bool {
    file_name.contains(STAGING_MARKER)
}

/// Splits a final artifact file name into window, stage and extension.
#[must_use]
pub fn parse_artifact_file_name(file_name: &str) -> Option<(TimeWindow, &str, &str)> {
    let window = TimeWindow::from_slug(file_name.get(..SLUG_LEN)?)?;
    let rest = file_name.get(SLUG_LEN..)?.strip_prefix('.')?;
    let (stage, extension) = rest.split_once('.')?;
    if stage.is_empty() || extension.is_empty() {
        return None;
    }
    Some((window, stage, extension))
}
