//! Pipeline planning.
//!
//! A plan is the ordered list of stages still needed to bring one input up
//! to a target stage. It is computed fresh for every run from the registry,
//! the artifact store and the input file, and never changes afterwards.

use crate::core::{Artifact, ArtifactKey};
use crate::errors::PlanningError;
use crate::input::InputValidator;
use crate::registry::{StageDescriptor, StageRegistry};
use crate::store::ArtifactStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// What the first planned step consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanOrigin {
    /// The input file stands in for this stage's output.
    RawInput {
        /// The stage the input file is adopted as.
        stage: String,
    },
    /// A Built artifact from an earlier run.
    Artifact(Artifact),
}

/// Ordered stages for one input.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    /// The caller-supplied input file.
    pub input_file: PathBuf,
    /// Radar and time window of the input.
    pub key: ArtifactKey,
    /// The requested final stage.
    pub target_stage: String,
    /// Stages to go through, in order.
    ///
    /// With a [`PlanOrigin::RawInput`] origin the first step is the adopted
    /// stage itself, which runs no process.
    pub steps: Vec<Arc<StageDescriptor>>,
    /// Where the chain is grounded.
    pub origin: PlanOrigin,
    /// Chain stages before the first step, already satisfied.
    pub skipped: Vec<String>,
}

impl PipelinePlan {
    /// Returns true if nothing needs to be done.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the planned stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the file the first step reads.
    #[must_use]
    pub fn origin_path(&self) -> &Path {
        match &self.origin {
            PlanOrigin::RawInput { .. } => &self.input_file,
            PlanOrigin::Artifact(artifact) => &artifact.file_path,
        }
    }

    /// Returns true if `step` is the adopted raw-input stage.
    #[must_use]
    pub fn is_adopted(&self, step: &StageDescriptor) -> bool {
        matches!(&self.origin, PlanOrigin::RawInput { stage } if *stage == step.name)
    }
}

/// Computes plans.
pub struct Planner {
    registry: Arc<StageRegistry>,
    store: Arc<ArtifactStore>,
    validator: Arc<dyn InputValidator>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("stages", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<ArtifactStore>,
        validator: Arc<dyn InputValidator>,
    ) -> Self {
        Self {
            registry,
            store,
            validator,
        }
    }

    /// Plans the stages needed to reach `target_stage` for one input.
    ///
    /// The chain is scanned backward from the target: the nearest Built
    /// artifact of a reusable stage grounds the plan. Without one, the
    /// input file is adopted as the output of the latest chain stage whose
    /// type it carries.
    ///
    /// # Errors
    ///
    /// `UnknownStage` / `CyclicDependency` from the registry, `InvalidInput`
    /// if the input file is unusable, `UnsatisfiableTarget` if neither an
    /// artifact nor the input grounds the chain.
    pub fn plan(
        &self,
        input_file: &Path,
        key: &ArtifactKey,
        target_stage: &str,
    ) -> Result<PipelinePlan, PlanningError> {
        let chain = self.registry.dependency_chain(target_stage)?;

        let built = chain.iter().enumerate().rev().find_map(|(idx, stage)| {
            if stage.is_source() || !stage.idempotent {
                return None;
            }
            self.store.lookup(key, &stage.name).map(|artifact| (idx, artifact))
        });

        let plan = if let Some((idx, artifact)) = built {
            PipelinePlan {
                input_file: input_file.to_path_buf(),
                key: key.clone(),
                target_stage: target_stage.to_string(),
                steps: chain[idx + 1..].to_vec(),
                skipped: chain[..=idx].iter().map(|s| s.name.clone()).collect(),
                origin: PlanOrigin::Artifact(artifact),
            }
        } else {
            self.validator.check(input_file)?;
            let idx = chain
                .iter()
                .rposition(|stage| self.validator.accepts(input_file, stage))
                .ok_or_else(|| PlanningError::UnsatisfiableTarget {
                    target: target_stage.to_string(),
                    input: input_file.to_path_buf(),
                })?;
            PipelinePlan {
                input_file: input_file.to_path_buf(),
                key: key.clone(),
                target_stage: target_stage.to_string(),
                steps: chain[idx..].to_vec(),
                skipped: chain[..idx].iter().map(|s| s.name.clone()).collect(),
                origin: PlanOrigin::RawInput {
                    stage: chain[idx].name.clone(),
                },
            }
        };

        debug!(
            key = %key,
            target = target_stage,
            steps = ?plan.stage_names(),
            skipped = ?plan.skipped,
            "Plan computed"
        );
        Ok(plan)
    }
}
