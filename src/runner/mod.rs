//! Subprocess execution pipeline.
//!
//! - [`protocol`]: wire event types and the sentinel-framed encoding shared
//!   with the in-script reporter
//! - [`framing`]: incremental decoder that reassembles events from chunked
//!   stdout
//! - [`progress`]: positional mapping of step events onto a run's step list
//! - [`artifacts`]: blob storage for failure screenshots
//! - [`supervisor`]: spawns runner subprocesses and drives a run from
//!   request to final status

pub mod artifacts;
pub mod framing;
pub mod progress;
pub mod protocol;
pub mod supervisor;
