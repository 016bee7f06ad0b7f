pub mod model;

#[cfg(feature = "dataset")]
pub mod dataset;

#[cfg(feature = "training")]
pub mod training;

#[cfg(feature = "training")]
pub mod evaluation;

pub use model::{MobileNetV2, MobileNetV2Config, ModelError, UNet, UNetConfig};

#[cfg(feature = "dataset")]
pub use dataset::{
    DataConfig, DatasetError, DatasetSplit, NucleiDataset, SegmentationBatch, SegmentationBatcher,
    SegmentationItem,
};

#[cfg(feature = "training")]
pub use training::{
    EarlyStopping, EarlyStoppingConfig, SegmentationOutput, Trainer, TrainingConfig, TrainingError,
    TrainingResult,
};

#[cfg(feature = "training")]
pub use evaluation::{
    EvaluationReport, evaluate, evaluate_with, predict_labels, render_triplet, show_predictions,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
