//! Per-input execution results.

use crate::core::{Artifact, RadarId, TimeWindow};
use crate::discovery::InputFile;
use crate::errors::FailureReason;
use crate::runner::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How one input ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every planned stage succeeded.
    Success,
    /// A stage failed; earlier artifacts are kept.
    PartialFailure {
        /// The failing stage.
        stage: String,
        /// Why it failed.
        reason: FailureReason,
    },
    /// The input never ran to completion for a reason outside any stage.
    Aborted {
        /// Human-readable reason.
        reason: String,
    },
}

impl Outcome {
    /// Returns true for [`Outcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure { stage, reason } => write!(f, "failed at '{stage}': {reason}"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

/// Result of running one input. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The input file.
    pub input_file: PathBuf,
    /// Radar of the input.
    pub radar_id: RadarId,
    /// Time window of the input.
    pub time_window: TimeWindow,
    /// The requested final stage.
    pub target_stage: String,
    /// Latest stage whose output is available after the run.
    pub final_stage_reached: Option<String>,
    /// How the run ended.
    pub outcome: Outcome,
    /// Artifacts recorded during this run, in stage order.
    pub produced_artifacts: Vec<Artifact>,
    /// Stages satisfied before the run started.
    pub skipped_stages: Vec<String>,
    /// Values extracted from stage stderr, keyed by stage.
    pub metrics: BTreeMap<String, f64>,
    /// Process attempts per stage.
    pub attempts: BTreeMap<String, usize>,
    /// Wall time of the whole input.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Builds the result for an input that never reached a stage.
    #[must_use]
    pub fn aborted(input: &InputFile, target_stage: &str, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            input_file: input.path.clone(),
            radar_id: input.key.radar_id.clone(),
            time_window: input.key.time_window,
            target_stage: target_stage.to_string(),
            final_stage_reached: None,
            outcome: Outcome::Aborted {
                reason: reason.into(),
            },
            produced_artifacts: Vec::new(),
            skipped_stages: Vec::new(),
            metrics: BTreeMap::new(),
            attempts: BTreeMap::new(),
            duration,
        }
    }

    /// Returns true if the input reached its target.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
