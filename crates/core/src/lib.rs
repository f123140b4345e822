//! Domain types shared by the pipeline engine and the HTTP API.
//!
//! Nothing in here performs scheduling or holds shared state; the job
//! state machine, progress aggregation, upload rules and ffmpeg helpers are
//! plain functions and types so both sides of the service agree on them.

pub mod error;
pub mod ffmpeg;
pub mod job;
pub mod media;
pub mod progress;
pub mod types;
