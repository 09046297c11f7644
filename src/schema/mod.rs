//! Typed records shared by every stage of the generation pipeline.

pub mod bucket;
pub mod coverage;
pub mod dimension;
pub mod example;
pub mod scenario;
