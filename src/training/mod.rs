pub mod callbacks;
pub mod early_stopping;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod pipeline;

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::DatasetError;
use crate::model::ModelError;

pub use callbacks::{PredictionDisplay, ScalarEvent, ScalarLogger, TrainingCallback};
pub use early_stopping::{EarlyStopping, EarlyStoppingConfig, Monitor, StoppingDecision};
pub use learner::{
    EpochSummary, SegmentationOutput, StopReason, Trainer, TrainingConfig, TrainingHistory,
    TrainingResult, validate, validation_steps,
};
pub use loss::{SegmentationCrossEntropyLoss, SegmentationCrossEntropyLossConfig};
pub use metrics::{ConfusionMatrix, MetricAccumulator, MetricSummary};
pub use pipeline::{CONFIG_FILE, EVALUATION_FILE, PREDICTIONS_DIR, train};

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to serialize summaries: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unable to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unexpected tensor data: {0}")]
    TensorData(String),

    #[error("Loss weights must be {expected} positive values, got {found:?}")]
    InvalidLossWeights { expected: usize, found: Vec<f32> },

    #[error("The training set is empty")]
    EmptyTrainingSet,
}

impl TrainingError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| TrainingError::Io { path, source }
    }
}
