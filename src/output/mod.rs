mod compose;
mod files;

pub use files::ImageFileSink;

use crate::sampler::{Mask, SamplerOutput};
use anyhow::Result;
use std::path::PathBuf;

/// Trait for artifact destinations
pub trait ArtifactSink {
    /// Write the inspection strip of one ensemble member
    fn write_member(
        &mut self,
        identifier: &str,
        index: usize,
        output: &SamplerOutput,
    ) -> Result<PathBuf>;

    /// Write the fused consensus map
    fn write_consensus(&mut self, identifier: &str, consensus: &Mask) -> Result<PathBuf>;
}
