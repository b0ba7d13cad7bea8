//! Build context.
//!
//! This module provides:
//! - The typed pipeline state shared by all stages of one build
//! - Stage-private scratch storage

mod scratch;
mod state;

pub use scratch::StageScratch;
pub use state::PipelineState;
