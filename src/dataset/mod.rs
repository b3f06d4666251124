mod folder;
mod preprocess;

pub use folder::FolderDataset;
pub use preprocess::Preprocessor;

use crate::sampler::Mask;
use ndarray::Array3;

/// One dataset entry at model resolution
pub struct DatasetItem {
    /// RGB image, CHW, values in [0, 1]
    pub image: Array3<f32>,
    /// Binary reference segmentation
    pub reference: Mask,
    /// Short name used for artifact files
    pub identifier: String,
}
