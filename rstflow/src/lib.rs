//! # rstflow
//!
//! Orchestration for Radar Software Toolkit (RST) processing chains.
//!
//! rstflow drives external RST executables over raw SuperDARN files and
//! keeps track of the intermediate products they leave behind:
//!
//! - **Stage registry**: the processing chain as data, validated acyclic at load
//! - **Artifact store**: produced files per radar, time window and stage
//! - **Planning**: only the stages an input still needs are run
//! - **Execution**: explicit working directory, environment and timeout per
//!   process, with failure classification and bounded retries
//! - **Archived inputs**: `.bz2` and `.gz` raw files are expanded on demand
//! - **Batches**: many inputs at once with bounded concurrency and
//!   cooperative cancellation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rstflow::prelude::*;
//!
//! let config = PipelineConfig::from_file("rstflow.json")?;
//! let pipeline = Arc::new(Pipeline::from_config(&config)?);
//! let coordinator = BatchCoordinator::new(pipeline);
//!
//! let inputs = discover_inputs(Path::new("/data/raw"), "rawacf")?;
//! let report = coordinator.run_batch(inputs, "grid", config.max_concurrency).await;
//! report.write_json(Path::new("report.json"))?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cancellation;
pub mod compression;
pub mod config;
pub mod core;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod input;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchCoordinator, BatchReport, BatchSummary};
    pub use crate::cancellation::CancellationToken;
    pub use crate::compression::Codec;
    pub use crate::config::{PipelineConfig, Toolkit, ToolkitConfig};
    pub use crate::core::{Artifact, ArtifactKey, ArtifactStatus, RadarId, TimeWindow};
    pub use crate::discovery::{discover_inputs, group_inputs, GroupBy, InputFile};
    pub use crate::errors::{
        ConfigurationError, FailureReason, PlanningError, ProcessError, RstflowError,
        StageFailure, StoreError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::input::{ExtensionValidator, InputValidator};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        ExecutionResult, ExecutorConfig, Outcome, Pipeline, PipelinePlan, Planner, RetryPolicy,
    };
    pub use crate::registry::{FitAlgorithm, OutputMode, StageDescriptor, StageRegistry};
    pub use crate::runner::{ProcessRunner, TokioProcessRunner};
    pub use crate::store::ArtifactStore;
}
