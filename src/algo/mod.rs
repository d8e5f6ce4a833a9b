//! Shared numeric helpers used across the pipeline.

pub mod stats;
