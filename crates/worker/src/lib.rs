// crates/worker/src/lib.rs
//! Worker: claims analysis jobs off the bus and drives them through the
//! parse → analyze → store pipeline.

pub mod analyzer;
pub mod config;
pub mod processor;

pub use analyzer::{Analyzer, AnalyzerConfig, AnalyzerError, CommandAnalyzer};
pub use config::WorkerConfig;
pub use processor::{process_job, JobOutcome, ProcessorConfig, WorkerContext, WorkerError};
