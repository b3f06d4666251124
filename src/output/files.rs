use super::compose::{compose_grid, mask_tile, member_tiles, TILE_PADDING};
use super::ArtifactSink;
use crate::sampler::{Mask, SamplerOutput};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Writes inspection images into one output directory
///
/// Member strips go to `<id>_output<i>.jpg`, the consensus to
/// `<id>_output_ens.jpg`.
pub struct ImageFileSink {
    out_dir: PathBuf,
}

impl ImageFileSink {
    pub fn new<P: AsRef<Path>>(out_dir: P) -> Result<Self> {
        let out_dir = out_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        tracing::info!("Writing artifacts to {}", out_dir.display());

        Ok(Self { out_dir })
    }
}

impl ArtifactSink for ImageFileSink {
    fn write_member(
        &mut self,
        identifier: &str,
        index: usize,
        output: &SamplerOutput,
    ) -> Result<PathBuf> {
        let path = self
            .out_dir
            .join(format!("{}_output{}.jpg", identifier, index));
        let grid = compose_grid(&member_tiles(output), 1, TILE_PADDING)?;
        grid.save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::debug!("Wrote {}", path.display());
        Ok(path)
    }

    fn write_consensus(&mut self, identifier: &str, consensus: &Mask) -> Result<PathBuf> {
        let path = self.out_dir.join(format!("{}_output_ens.jpg", identifier));
        let grid = compose_grid(&[mask_tile(consensus)], 1, TILE_PADDING)?;
        grid.save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::debug!("Wrote {}", path.display());
        Ok(path)
    }
}
