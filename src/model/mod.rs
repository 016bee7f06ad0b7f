mod blocks;
mod encoder;
mod unet;

use std::path::PathBuf;

use thiserror::Error;

pub use blocks::{
    ConvNormBlock, ConvNormBlockConfig, InvertedResidual, InvertedResidualConfig, UpsampleBlock,
    UpsampleBlockConfig,
};
pub use encoder::{EncoderFeatures, FEATURE_LAYERS, MobileNetV2, MobileNetV2Config, OUTPUT_STRIDE};
pub use unet::{MODEL_CONFIG_FILE, MODEL_FILE, UNet, UNetConfig};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Input size {0:?} must be a positive multiple of {1}")]
    InvalidInputSize([usize; 2], usize),

    #[error("Images are resized to {data:?} but the model expects {model:?}")]
    InputSizeMismatch { model: [usize; 2], data: [usize; 2] },

    #[error("The model needs at least one output class")]
    InvalidClassCount,

    #[error("Unable to load weights from {path:?}: {reason}")]
    Weights { path: PathBuf, reason: String },

    #[error("Unable to read model config {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: `{0}`")]
    Io(#[from] std::io::Error),
}
