//! Job orchestration engine.
//!
//! Owns the shared [`store::JobStore`], runs the five processing stages for
//! each job through [`orchestrator::PipelineOrchestrator`], and tracks live
//! runs in [`runner::JobRunner`]. The actual frame processing and encoding
//! happen in external collaborators reached through the
//! [`backend::ProcessingBackend`] and [`transcoder::Transcoder`] traits.

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod reporter;
pub mod retry;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod transcoder;
pub mod workspace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
