//! Pipeline event emission.
//!
//! The executor and batch coordinator report progress through an
//! [`EventSink`]. Event names are dotted: `pipeline.*` for one input,
//! `stage.*` for one stage invocation, `batch.*` for a whole batch.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A plan was computed and execution of one input begins.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Every planned stage of one input succeeded.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// One input stopped at a failing stage.
pub const PIPELINE_FAILED: &str = "pipeline.failed";
/// One input was aborted (planning error or cancellation).
pub const PIPELINE_ABORTED: &str = "pipeline.aborted";
/// A stage invocation begins.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage produced and recorded its artifact.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed for good.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage attempt failed and will be retried.
pub const STAGE_RETRYING: &str = "stage.retrying";
/// A batch was scheduled.
pub const BATCH_STARTED: &str = "batch.started";
/// A batch finished; every input has a result.
pub const BATCH_COMPLETED: &str = "batch.completed";
