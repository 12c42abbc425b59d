//! Core crate for the avatarflow render pipeline.

pub mod assemble;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod naming;
pub mod pipeline;
pub mod runtime;
pub mod workflow;

pub use error::{PipelineError, PipelineResult};

#[cfg(test)]
#[path = "../tests/support/mod.rs"]
mod test_support;
