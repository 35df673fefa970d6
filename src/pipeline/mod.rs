//! OCR and grouping pipeline.
//!
//! - `WorkerPool`: parallel OCR over claimed pages, one worker per credential
//! - `GroupingEngine`: sequential assembly of results into page groups
//! - `Reclaimer`: releases claims abandoned by crashed processes
//! - `PipelineRunner`: the polling loop tying them together
//! - `EventBus`: structured progress events

mod error;
pub mod events;
pub mod grouping;
pub mod pool;
mod queue;
pub mod reclaim;
mod results;
pub mod runner;

pub use error::PipelineError;
pub use events::{EventBus, EventRecord, PipelineEvent, Severity};
pub use grouping::{GroupSink, GroupingEngine, GroupingOutcome, OpenGroup, Segmenter};
pub use pool::{PoolReport, WorkerPool};
pub use queue::{QueuedItem, WorkQueue};
pub use reclaim::Reclaimer;
pub use results::{PageResult, ResultMap};
pub use runner::{BatchReport, PipelineRunner, RunSummary, RunnerHandle};
