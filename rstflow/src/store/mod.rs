//! Artifact store.
//!
//! Tracks which file each stage produced for each (radar, time window)
//! key. The in-memory index is the authority during a run; the output
//! directory is the authority across runs and can be re-read with
//! [`ArtifactStore::reconcile`].
//!
//! All mutation for one key happens under that key's lease, so two
//! pipelines never race on the same radar and window while distinct keys
//! proceed in parallel.

mod layout;

pub use layout::{
    absolute_path, artifact_file_name, artifact_path, is_staging_file, parse_artifact_file_name,
    staging_path, STAGING_MARKER,
};

use crate::core::{file_checksum, Artifact, ArtifactKey, ArtifactStatus, RadarId};
use crate::errors::{PlanningError, StoreError};
use crate::registry::StageRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

type EntryKey = (ArtifactKey, String);
type LeaseTable = DashMap<ArtifactKey, Arc<Mutex<()>>>;

/// Exclusive access to one artifact key. Released on drop.
#[derive(Debug)]
pub struct KeyLease {
    key: ArtifactKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LeaseTable>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own handle left: nobody holds or waits for the key.
        self.table
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyLease {
    /// Returns the leased key.
    #[must_use]
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }
}

/// Counts from a [`ArtifactStore::reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Artifacts found and indexed.
    pub indexed: usize,
    /// Staging files from interrupted runs that were deleted.
    pub partials_removed: usize,
    /// Files that do not belong to any registered stage.
    pub ignored: usize,
}

/// Index of produced files, keyed by (radar, window, stage).
#[derive(Debug)]
pub struct ArtifactStore {
    registry: Arc<StageRegistry>,
    output_dir: PathBuf,
    checksums: bool,
    entries: DashMap<EntryKey, Artifact>,
    leases: Arc<LeaseTable>,
}

fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl ArtifactStore {
    /// Creates an empty store rooted at `output_dir`, made absolute.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            output_dir: absolute_path(&output_dir.into()),
            checksums: false,
            entries: DashMap::new(),
            leases: Arc::new(DashMap::new()),
        }
    }

    /// Enables SHA-256 checksums on recorded artifacts.
    #[must_use]
    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    /// Returns the output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Returns the stage registry the store cascades over.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    fn lease_lock(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        Arc::clone(self.leases.entry(key.clone()).or_default().value())
    }

    fn wrap_guard(&self, key: &ArtifactKey, guard: OwnedMutexGuard<()>) -> KeyLease {
        KeyLease {
            key: key.clone(),
            guard: Some(guard),
            table: Arc::clone(&self.leases),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lease(&self, key: &ArtifactKey) -> KeyLease {
        let guard = self.lease_lock(key).lock_owned().await;
        self.wrap_guard(key, guard)
    }

    /// Takes the lease for `key` if nobody holds it.
    #[must_use]
    pub fn try_lease(&self, key: &ArtifactKey) -> Option<KeyLease> {
        self.lease_lock(key)
            .try_lock_owned()
            .ok()
            .map(|guard| self.wrap_guard(key, guard))
    }

    /// Returns how many keys currently have a lease table entry.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.len()
    }

    /// Returns the deterministic final path of `stage`'s output for `key`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage is not registered.
    pub fn output_path_for(&self, key: &ArtifactKey, stage: &str) -> Result<PathBuf, PlanningError> {
        let descriptor = self.registry.resolve(stage)?;
        Ok(artifact_path(
            &self.output_dir,
            key,
            &descriptor.name,
            &descriptor.output_extension,
        ))
    }

    /// Returns the artifact if it is Built and its file still exists.
    #[must_use]
    pub fn lookup(&self, key: &ArtifactKey, stage: &str) -> Option<Artifact> {
        let entry = self.entries.get(&(key.clone(), stage.to_string()))?;
        if entry.status.is_usable() && entry.file_path.is_file() {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Returns the entry regardless of status.
    #[must_use]
    pub fn get(&self, key: &ArtifactKey, stage: &str) -> Option<Artifact> {
        self.entries
            .get(&(key.clone(), stage.to_string()))
            .map(|entry| entry.clone())
    }

    /// Returns every entry for `key` in stage definition order.
    #[must_use]
    pub fn artifacts_for(&self, key: &ArtifactKey) -> Vec<Artifact> {
        self.registry
            .stage_names()
            .iter()
            .filter_map(|stage| self.get(key, stage))
            .collect()
    }

    /// Records a produced file as Built.
    ///
    /// Replacing an existing entry is a rebuild: every downstream artifact
    /// of the same key becomes Stale.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArtifact` if the file does not exist, or `Io` if the
    /// checksum cannot be computed.
    pub fn record(&self, mut artifact: Artifact) -> Result<Artifact, StoreError> {
        let metadata = match std::fs::metadata(&artifact.file_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                return Err(StoreError::InvalidArtifact {
                    path: artifact.file_path,
                })
            }
        };

        artifact.size_bytes = metadata.len();
        if self.checksums && artifact.checksum.is_none() {
            artifact.checksum = Some(file_checksum(&artifact.file_path)?);
        }
        artifact.status = ArtifactStatus::Built;

        let entry_key = (artifact.key.clone(), artifact.stage_name.clone());
        let previous = self.entries.insert(entry_key, artifact.clone());

        debug!(
            key = %artifact.key,
            stage = %artifact.stage_name,
            path = %artifact.file_path.display(),
            size_bytes = artifact.size_bytes,
            "Artifact recorded"
        );

        if previous.is_some() {
            let staled = self.mark_stale(&artifact.key, self.registry.descendants(&artifact.stage_name));
            if staled > 0 {
                info!(key = %artifact.key, stage = %artifact.stage_name, staled, "Rebuild invalidated downstream artifacts");
            }
        }

        Ok(artifact)
    }

    /// Marks `stage`'s entry for `key` Failed, creating it if needed.
    pub fn mark_failed(&self, key: &ArtifactKey, stage: &str) {
        let entry_key = (key.clone(), stage.to_string());
        if let Some(mut entry) = self.entries.get_mut(&entry_key) {
            entry.status = ArtifactStatus::Failed;
            return;
        }
        if let Ok(path) = self.output_path_for(key, stage) {
            let mut artifact = Artifact::new(key.clone(), stage, path);
            artifact.status = ArtifactStatus::Failed;
            self.entries.insert(entry_key, artifact);
        }
    }

    /// Marks `stage` and everything downstream of it Stale for `key`.
    ///
    /// Waits for the key's lease, so a running pipeline finishes first.
    /// Ancestors and other keys are untouched. Returns how many entries
    /// changed status.
    pub async fn invalidate(&self, key: &ArtifactKey, stage: &str) -> usize {
        let lease = self.lease(key).await;
        self.invalidate_leased(&lease, stage)
    }

    /// [`invalidate`](Self::invalidate) for a caller already holding the lease.
    pub fn invalidate_leased(&self, lease: &KeyLease, stage: &str) -> usize {
        let key = lease.key();
        let mut stages = vec![stage.to_string()];
        stages.extend(self.registry.descendants(stage));
        let staled = self.mark_stale(key, stages);
        debug!(key = %key, stage, staled, "Artifacts invalidated");
        staled
    }

    fn mark_stale(&self, key: &ArtifactKey, stages: Vec<String>) -> usize {
        let mut staled = 0;
        for stage in stages {
            if let Some(mut entry) = self.entries.get_mut(&(key.clone(), stage)) {
                if entry.status != ArtifactStatus::Stale {
                    entry.status = ArtifactStatus::Stale;
                    staled += 1;
                }
            }
        }
        staled
    }

    /// Deletes every temporary artifact's file and entry.
    ///
    /// Each key is leased in turn, so a pipeline that planned from a
    /// temporary artifact keeps it until its run ends.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file exists but cannot be deleted.
    pub async fn remove_temporary(&self) -> Result<usize, StoreError> {
        let mut targets: BTreeMap<ArtifactKey, Vec<String>> = BTreeMap::new();
        for entry in self.entries.iter().filter(|entry| entry.temporary) {
            let (key, stage) = entry.key().clone();
            targets.entry(key).or_default().push(stage);
        }

        let mut removed = 0;
        for (key, stages) in targets {
            let lease = self.lease(&key).await;
            for stage in stages {
                let still_temporary = self
                    .entries
                    .get(&(key.clone(), stage.clone()))
                    .is_some_and(|entry| entry.temporary);
                if still_temporary && self.remove_leased(&lease, &stage, true)?.is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Temporary artifacts removed");
        }
        Ok(removed)
    }

    /// Removes one entry under the key's lease, optionally deleting its file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file exists but cannot be deleted; the entry is
    /// kept in that case.
    pub async fn remove(
        &self,
        key: &ArtifactKey,
        stage: &str,
        delete_file: bool,
    ) -> Result<Option<Artifact>, StoreError> {
        let lease = self.lease(key).await;
        self.remove_leased(&lease, stage, delete_file)
    }

    /// [`remove`](Self::remove) for a caller already holding the lease.
    ///
    /// # Errors
    ///
    /// Same as [`remove`](Self::remove).
    pub fn remove_leased(
        &self,
        lease: &KeyLease,
        stage: &str,
        delete_file: bool,
    ) -> Result<Option<Artifact>, StoreError> {
        let entry_key = (lease.key().clone(), stage.to_string());
        if delete_file {
            if let Some(path) = self.entries.get(&entry_key).map(|e| e.file_path.clone()) {
                remove_file_if_exists(&path)?;
            }
        }
        Ok(self.entries.remove(&entry_key).map(|(_, artifact)| artifact))
    }

    /// Rebuilds the index from the output directory.
    ///
    /// Files matching a registered tool stage's name and extension are
    /// indexed as Built, unless the previous index already knew them as
    /// Stale or Failed. Staging files are deleted. Anything else is left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be read or a staging file
    /// cannot be deleted.
    pub fn reconcile(&self) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        let previous: HashMap<PathBuf, ArtifactStatus> = self
            .entries
            .iter()
            .map(|entry| (entry.file_path.clone(), entry.status))
            .collect();
        self.entries.clear();

        let radar_dirs = match std::fs::read_dir(&self.output_dir) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(summary),
            Err(e) => return Err(e.into()),
        };

        for radar_dir in radar_dirs {
            let radar_dir = radar_dir?;
            if !radar_dir.file_type()?.is_dir() {
                continue;
            }
            let Ok(radar) = RadarId::new(radar_dir.file_name().to_string_lossy().into_owned()) else {
                continue;
            };

            for file in std::fs::read_dir(radar_dir.path())? {
                let file = file?;
                let path = file.path();
                let name = file.file_name().to_string_lossy().into_owned();

                if is_staging_file(&name) {
                    if remove_file_if_exists(&path)? {
                        warn!(path = %path.display(), "Removed leftover staging file");
                    }
                    summary.partials_removed += 1;
                    continue;
                }

                match self.artifact_from_file(&radar, &name, &path)? {
                    Some(mut artifact) => {
                        if let Some(status @ (ArtifactStatus::Stale | ArtifactStatus::Failed)) =
                            previous.get(&path).copied()
                        {
                            artifact.status = status;
                        }
                        self.entries
                            .insert((artifact.key.clone(), artifact.stage_name.clone()), artifact);
                        summary.indexed += 1;
                    }
                    None => summary.ignored += 1,
                }
            }
        }

        info!(
            output_dir = %self.output_dir.display(),
            indexed = summary.indexed,
            partials_removed = summary.partials_removed,
            ignored = summary.ignored,
            "Artifact store reconciled"
        );
        Ok(summary)
    }

    fn artifact_from_file(
        &self,
        radar: &RadarId,
        name: &str,
        path: &Path,
    ) -> Result<Option<Artifact>, StoreError> {
        let Some((window, stage, extension)) = parse_artifact_file_name(name) else {
            return Ok(None);
        };
        let Ok(descriptor) = self.registry.resolve(stage) else {
            return Ok(None);
        };
        if descriptor.is_source() || descriptor.output_extension != extension {
            return Ok(None);
        }

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Ok(None);
        }

        let key = ArtifactKey::new(radar.clone(), window);
        let mut artifact = Artifact::new(key, stage, path)
            .temporary(descriptor.temporary)
            .with_size(metadata.len());
        if let Ok(modified) = metadata.modified() {
            artifact = artifact.with_created_at(DateTime::<Utc>::from(modified));
        }
        if self.checksums {
            artifact = artifact.with_checksum(file_checksum(path)?);
        }
        artifact.status = ArtifactStatus::Built;
        Ok(Some(artifact))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
