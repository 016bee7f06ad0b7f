use std::path::Path;

use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};

use super::{PredictionDisplay, ScalarLogger, Trainer, TrainingConfig, TrainingError, TrainingResult};
use crate::dataset::{NucleiDataset, test_loader, train_test_split};
use crate::evaluation::{evaluate_with, show_predictions};

/// Full training configuration saved in the artifact directory.
pub const CONFIG_FILE: &str = "config.json";
pub const PREDICTIONS_DIR: &str = "predictions";
pub const EVALUATION_FILE: &str = "evaluation.json";

/// Batches rendered from the test split once training is done.
const SHOWN_PREDICTIONS: usize = 3;

/// Load one dataset root, split it, train a fresh model and write the
/// weights, configuration, summaries and sample predictions.
///
/// `encoder_weights` points to a pretrained MobileNetV2 record; without it
/// the frozen encoder keeps its random initialization.
pub fn train<B: AutodiffBackend>(
    data_root: &Path,
    artifact_dir: &Path,
    log_root: &Path,
    encoder_weights: Option<&Path>,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingResult<B>, TrainingError> {
    config.validate()?;

    std::fs::create_dir_all(artifact_dir).map_err(TrainingError::io(artifact_dir))?;
    let config_path = artifact_dir.join(CONFIG_FILE);
    config
        .save(&config_path)
        .map_err(TrainingError::io(&config_path))?;

    B::seed(config.seed);

    let dataset = NucleiDataset::from_folder(data_root, config.data.image_size)?;
    let split = train_test_split(
        dataset.into_items(),
        config.data.test_fraction,
        config.data.seed,
    )?;
    tracing::info!(
        "{} training and {} test samples",
        split.train.len(),
        split.test.len()
    );

    let mut model = config.model.init::<B>(&device);
    match encoder_weights {
        Some(path) => {
            tracing::info!("Loading pretrained encoder from {}", path.display());
            model = model.with_pretrained_encoder(path, &device)?;
        }
        None => tracing::warn!("No pretrained encoder given, the frozen encoder is random"),
    }

    let test_items = split.test.clone();
    let mut trainer = Trainer::<B>::new(config.clone(), device.clone())
        .with_callback(ScalarLogger::new(log_root)?);
    // Follow one training sample across epochs, unaugmented.
    if let Some(sample) = split.train.first() {
        trainer = trainer.with_callback(PredictionDisplay::new(
            sample.clone(),
            artifact_dir.join(PREDICTIONS_DIR).join("epochs"),
        )?);
    }

    let result = trainer.fit(model, split)?;

    result.model.clone().save(&config.model, artifact_dir)?;
    tracing::info!("Saved model to {}", artifact_dir.display());

    if !test_items.is_empty() {
        let model = result.model.valid();
        let loss = config.loss.init::<B::InnerBackend>(&device);
        let loader = test_loader::<B::InnerBackend>(test_items, &config.data, device);

        show_predictions(
            &model,
            loader.as_ref(),
            SHOWN_PREDICTIONS,
            &artifact_dir.join(PREDICTIONS_DIR),
        )?;

        let report = evaluate_with(&model, loader.as_ref(), &loss)?;
        tracing::info!("Evaluation on the test split:\n{report}");

        let path = artifact_dir.join(EVALUATION_FILE);
        let file = std::fs::File::create(&path).map_err(TrainingError::io(&path))?;
        serde_json::to_writer_pretty(file, &report)?;
    }

    Ok(result)
}
