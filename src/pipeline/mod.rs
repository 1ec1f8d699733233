//! Durable multi-stage execution of the raster transforms

pub mod context;
pub mod retry;
pub mod storage;
pub mod collaborators;
pub mod stages;
pub mod sequencer;
pub mod workflows;

// Re-export main types
pub use context::{CancellationToken, RunLog, StageContext};
pub use retry::{FixedJitter, JitterSource, RandomJitter, RetryPolicy, Sleeper, TokioSleeper};
pub use storage::{generate_run_id, RunStorage};
pub use collaborators::{Acquisition, DirectoryPublication, LocalDirectoryAcquisition, Publication, SourceDescriptor};
pub use stages::{AcquireStage, ConvertHdfStage, MosaicStage, PublishStage, RescaleStage, Stage, StageOutput};
pub use sequencer::{RunFailure, RunOutcome, RunState, Sequencer};
