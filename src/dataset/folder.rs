use super::preprocess::Preprocessor;
use super::DatasetItem;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const MASK_SUFFIX: &str = "_Segmentation";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

struct Entry {
    image_path: PathBuf,
    mask_path: PathBuf,
    identifier: String,
}

/// Flat folder of images with `<stem>_Segmentation.png` reference masks
///
/// The listing is taken once on open; every call to `iter` starts a fresh
/// pass over it.
pub struct FolderDataset {
    entries: Vec<Entry>,
    preprocessor: Preprocessor,
}

impl FolderDataset {
    pub fn open<P: AsRef<Path>>(dir: P, image_size: u32) -> Result<Self> {
        let dir = dir.as_ref();

        tracing::info!("Scanning dataset at {}", dir.display());

        let mut images = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read dataset directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_image(&path) && !is_mask(&path) {
                images.push(path);
            }
        }
        images.sort();

        let entries: Vec<Entry> = images
            .into_iter()
            .filter_map(|image_path| {
                let stem = image_path.file_stem()?.to_str()?.to_string();
                let mask_path = dir.join(format!("{}{}.png", stem, MASK_SUFFIX));
                Some(Entry {
                    identifier: identifier_from_stem(&stem),
                    image_path,
                    mask_path,
                })
            })
            .collect();

        tracing::info!("Found {} images", entries.len());

        Ok(Self {
            entries,
            preprocessor: Preprocessor::new(image_size, image_size),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One pass over the dataset in file-name order
    ///
    /// A broken item yields an error for that item only.
    pub fn iter(&self) -> impl Iterator<Item = Result<DatasetItem>> + '_ {
        self.entries.iter().map(move |entry| self.load(entry))
    }

    fn load(&self, entry: &Entry) -> Result<DatasetItem> {
        let image = image::open(&entry.image_path)
            .with_context(|| format!("Failed to read image {}", entry.image_path.display()))?
            .to_rgb8();
        let mask = image::open(&entry.mask_path)
            .with_context(|| format!("Failed to read mask {}", entry.mask_path.display()))?
            .to_luma8();

        Ok(DatasetItem {
            image: self.preprocessor.preprocess(&image),
            reference: self.preprocessor.preprocess_mask(&mask),
            identifier: entry.identifier.clone(),
        })
    }
}

/// Short identifier used to name artifacts: last `_` component of the stem
/// (`ISIC_0000012` -> `0000012`)
pub fn identifier_from_stem(stem: &str) -> String {
    stem.rsplit('_').next().unwrap_or(stem).to_string()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_mask(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.ends_with(MASK_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_pair(dir: &Path, stem: &str) {
        RgbImage::from_pixel(10, 10, Rgb([120, 40, 200]))
            .save(dir.join(format!("{}.jpg", stem)))
            .unwrap();
        GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 255 } else { 0 }]))
            .save(dir.join(format!("{}_Segmentation.png", stem)))
            .unwrap();
    }

    #[test]
    fn identifier_is_last_stem_component() {
        assert_eq!(identifier_from_stem("ISIC_0000012"), "0000012");
        assert_eq!(identifier_from_stem("plain"), "plain");
        assert_eq!(identifier_from_stem("a_b_c"), "c");
    }

    #[test]
    fn pairs_images_with_masks() {
        let dir = tempdir().unwrap();
        write_pair(dir.path(), "ISIC_0000002");
        write_pair(dir.path(), "ISIC_0000001");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let dataset = FolderDataset::open(dir.path(), 8).unwrap();
        assert_eq!(dataset.len(), 2);

        let items: Vec<DatasetItem> = dataset.iter().collect::<Result<_>>().unwrap();
        assert_eq!(items[0].identifier, "0000001");
        assert_eq!(items[1].identifier, "0000002");
        assert_eq!(items[0].image.dim(), (3, 8, 8));
        assert_eq!(items[0].reference.dim(), (8, 8));
        assert_eq!(items[0].reference[[0, 0]], 1.0);
        assert_eq!(items[0].reference[[0, 7]], 0.0);
    }

    #[test]
    fn iteration_is_restartable() {
        let dir = tempdir().unwrap();
        write_pair(dir.path(), "ISIC_0000001");

        let dataset = FolderDataset::open(dir.path(), 8).unwrap();
        assert_eq!(dataset.iter().count(), 1);
        assert_eq!(dataset.iter().count(), 1);
    }

    #[test]
    fn missing_mask_fails_only_that_item() {
        let dir = tempdir().unwrap();
        write_pair(dir.path(), "ISIC_0000001");
        RgbImage::new(10, 10)
            .save(dir.path().join("ISIC_0000002.jpg"))
            .unwrap();

        let dataset = FolderDataset::open(dir.path(), 8).unwrap();
        let results: Vec<Result<DatasetItem>> = dataset.iter().collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(FolderDataset::open(dir.path().join("absent"), 8).is_err());
    }
}
