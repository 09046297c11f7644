//! Corpus Forge — coverage-driven synthetic training data generation.
//!
//! Tracks which combinations of scenario parameters (capacity level,
//! authenticity target, behavioral complexity) have been produced, steers
//! generation toward under-filled combinations, and validates finished
//! batches against coverage and distribution-shape requirements.

pub mod core;
pub mod schema;
