mod augment;
mod loader;
mod preprocess;
mod segmentation;
mod split;

use std::path::PathBuf;

use burn::prelude::*;
use thiserror::Error;

pub use augment::{HorizontalFlip, flip_horizontal};
pub use loader::{NucleiDataset, SUPPORTED_FILES};
pub use preprocess::{binarize_mask, binarize_value, normalize_image};
pub use segmentation::{
    RepeatingLoader, SegmentationBatch, SegmentationBatcher, SegmentationItem, steps_per_epoch,
    test_loader, train_loader,
};
pub use split::{DatasetSplit, split_indices, train_test_split};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory does not exist: {0:?}")]
    MissingDirectory(PathBuf),

    #[error("No mask found for image {0:?}")]
    MissingMask(PathBuf),

    #[error("Several files share the stem `{0}`")]
    DuplicateStem(String),

    #[error("Unable to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("No images found in {0:?}")]
    Empty(PathBuf),

    #[error("Test fraction must be in (0, 1), got {0}")]
    InvalidSplit(f64),
}

/// Data loading, splitting and batching parameters.
#[derive(Config, Debug)]
pub struct DataConfig {
    /// `[height, width]` every image and mask is resized to.
    #[config(default = "[128, 128]")]
    pub image_size: [usize; 2],
    #[config(default = "0.2")]
    pub test_fraction: f64,
    /// Seed of the split, the loader shuffle and the flip augmentation.
    #[config(default = "42")]
    pub seed: u64,
    #[config(default = "16")]
    pub batch_size: usize,
    #[config(default = "4")]
    pub num_workers: usize,
    #[config(default = "true")]
    pub augment: bool,
    #[config(default = "0.5")]
    pub flip_probability: f64,
}
