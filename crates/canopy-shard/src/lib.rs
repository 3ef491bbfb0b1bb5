//! Per-shard transaction commit pipeline.
//!
//! The pipeline drives local transactions through validate → prepare →
//! commit against the tree engine and the replication log, owning the
//! three ordered queues that together form one logical open-transaction
//! FIFO per shard. All state is mutated by a single logical owner; the
//! [`executor`] module provides the serialized task loop that owner runs
//! on, and external completions are re-marshalled onto it.

pub mod cohort;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;

pub use cohort::{CohortState, CommitCallback, CommitCohort, StepCallback};
pub use config::ShardConfig;
pub use error::PipelineError;
pub use executor::{MappedHost, SerialExecutor, TaskQueue};
pub use pipeline::{CommitPipeline, PipelineHost, MAX_TRANSACTION_BATCH};
