use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use image::imageops::{self, FilterType};

use super::{DatasetError, SegmentationItem, binarize_mask, normalize_image};

pub const SUPPORTED_FILES: [&str; 6] = ["bmp", "jpg", "jpeg", "png", "tif", "tiff"];

const INPUTS_DIR: &str = "inputs";
const MASKS_DIR: &str = "masks";

/// Nuclei images and their binary masks, decoded, resized and preprocessed
/// in memory.
#[derive(Debug, Clone)]
pub struct NucleiDataset {
    items: Vec<SegmentationItem>,
}

impl Dataset<SegmentationItem> for NucleiDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl NucleiDataset {
    /// Load every image of `<root>/inputs` together with the mask of the same
    /// file stem in `<root>/masks`.
    ///
    /// Fails on the first missing directory, missing mask or undecodable
    /// file; no partial dataset is returned.
    pub fn from_folder<P: AsRef<Path>>(
        root: P,
        image_size: [usize; 2],
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let images_dir = root.join(INPUTS_DIR);
        let masks_dir = root.join(MASKS_DIR);

        let images = list_images(&images_dir)?;
        let masks = list_images(&masks_dir)?;

        if images.is_empty() {
            return Err(DatasetError::Empty(images_dir));
        }

        let mut pairs = Vec::with_capacity(images.len());
        for (stem, image_path) in images {
            match masks.get(&stem) {
                Some(mask_path) => pairs.push((image_path, mask_path.clone())),
                None => return Err(DatasetError::MissingMask(image_path)),
            }
        }

        if masks.len() > pairs.len() {
            tracing::warn!(
                "Ignoring {} masks without a matching image in {}",
                masks.len() - pairs.len(),
                masks_dir.display()
            );
        }

        tracing::info!("Loading {} image/mask pairs from {}", pairs.len(), root.display());

        Self::from_pairs(pairs, image_size)
    }

    /// Load an explicit list of `(image path, mask path)` pairs.
    pub fn from_pairs<P: AsRef<Path>>(
        pairs: Vec<(P, P)>,
        image_size: [usize; 2],
    ) -> Result<Self, DatasetError> {
        let items = pairs
            .iter()
            .map(|(image_path, mask_path)| {
                load_item(image_path.as_ref(), mask_path.as_ref(), image_size)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { items })
    }

    pub fn items(&self) -> &[SegmentationItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<SegmentationItem> {
        self.items
    }
}

fn load_item(
    image_path: &Path,
    mask_path: &Path,
    image_size: [usize; 2],
) -> Result<SegmentationItem, DatasetError> {
    let [height, width] = image_size;

    let image = open_image(image_path)?.into_rgb8();
    let image = imageops::resize(&image, width as u32, height as u32, FilterType::Triangle);

    let mask = open_image(mask_path)?.into_luma8();
    let mask = imageops::resize(&mask, width as u32, height as u32, FilterType::Triangle);

    let name = image_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(SegmentationItem::new(
        name,
        normalize_image(&image),
        binarize_mask(&mask),
        image_size,
    ))
}

fn open_image(path: &Path) -> Result<image::DynamicImage, DatasetError> {
    image::open(path).map_err(|source| DatasetError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Supported image files of `dir`, keyed (and therefore sorted) by file stem.
fn list_images(dir: &Path) -> Result<BTreeMap<String, PathBuf>, DatasetError> {
    if !dir.is_dir() {
        return Err(DatasetError::MissingDirectory(dir.to_path_buf()));
    }

    let io_error = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();

        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                SUPPORTED_FILES
                    .iter()
                    .any(|valid_ext| valid_ext.eq_ignore_ascii_case(ext))
            });
        if !path.is_file() || !supported {
            continue;
        }

        if let Some(stem) = path.file_stem() {
            let stem = stem.to_string_lossy().into_owned();
            if files.insert(stem.clone(), path).is_some() {
                return Err(DatasetError::DuplicateStem(stem));
            }
        }
    }

    Ok(files)
}
