//! Error aggregation and run reporting
//!
//! Rolls per-sequencer error counts into one process-wide total and builds
//! the end-of-run summary used for the final exit code.

pub mod aggregate;
