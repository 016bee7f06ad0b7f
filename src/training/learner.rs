use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::{AdamConfig, Optimizer},
    prelude::*,
    tensor::{Int, backend::AutodiffBackend},
};
use derive_new::new;
use serde::{Deserialize, Serialize};

use super::{
    EarlyStoppingConfig, MetricAccumulator, MetricSummary, SegmentationCrossEntropyLoss,
    SegmentationCrossEntropyLossConfig, StoppingDecision, TrainingCallback, TrainingError,
};
use crate::dataset::{
    DataConfig, DatasetSplit, RepeatingLoader, SegmentationBatch, steps_per_epoch, test_loader,
    train_loader,
};
use crate::model::{ModelError, UNet, UNetConfig};

#[derive(new)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, 4>,
    pub targets: Tensor<B, 4, Int>,
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: UNetConfig,
    pub data: DataConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    /// Criterion for both the training steps and the validation pass.
    #[config(default = "SegmentationCrossEntropyLossConfig::new()")]
    pub loss: SegmentationCrossEntropyLossConfig,
    #[config(default = "10")]
    pub num_epochs: usize,
    #[config(default = "1e-3")]
    pub learning_rate: f64,
    /// The validation pass covers `1 / val_subsplits` of the test set.
    #[config(default = "10")]
    pub val_subsplits: usize,
    /// `None` trains for exactly `num_epochs`.
    pub early_stopping: Option<EarlyStoppingConfig>,
    #[config(default = "42")]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject configurations whose tensors could not line up: the resize
    /// target must be the model input and class weights must cover every
    /// output channel.
    pub fn validate(&self) -> Result<(), TrainingError> {
        self.model.validate()?;

        if self.data.image_size != self.model.input_size {
            return Err(ModelError::InputSizeMismatch {
                model: self.model.input_size,
                data: self.data.image_size,
            }
            .into());
        }

        if let Some(weights) = &self.loss.weights {
            let positive = weights.iter().all(|weight| *weight > 0.0);
            if weights.len() != self.model.num_classes || !positive {
                return Err(TrainingError::InvalidLossWeights {
                    expected: self.model.num_classes,
                    found: weights.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Validation batches per epoch: `len / batch_size / subsplits`. Zero means
/// a full pass over the test loader.
pub fn validation_steps(len: usize, batch_size: usize, subsplits: usize) -> usize {
    len / batch_size.max(1) / subsplits.max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: MetricSummary,
    pub valid: Option<MetricSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxEpochs,
    EarlyStopped { epoch: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochSummary>,
    pub stop_reason: StopReason,
    /// Epoch whose weights the final model carries.
    pub best_epoch: Option<usize>,
}

pub struct TrainingResult<B: AutodiffBackend> {
    pub model: UNet<B>,
    pub history: TrainingHistory,
}

/// Epoch loop around [UNet::train_step_with]: Adam updates on an endless shuffled
/// stream, an optional validation pass, per-epoch callbacks and early
/// stopping with best-weight restoration.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    callbacks: Vec<Box<dyn TrainingCallback<B>>>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            callbacks: Vec::new(),
        }
    }

    pub fn with_callback<C: TrainingCallback<B> + 'static>(mut self, callback: C) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn fit(
        mut self,
        mut model: UNet<B>,
        split: DatasetSplit,
    ) -> Result<TrainingResult<B>, TrainingError> {
        self.config.validate()?;

        let data = &self.config.data;
        let num_classes = model.num_classes();
        let steps = steps_per_epoch(split.train.len(), data.batch_size);
        if steps == 0 {
            return Err(TrainingError::EmptyTrainingSet);
        }
        let valid_steps =
            validation_steps(split.test.len(), data.batch_size, self.config.val_subsplits);

        tracing::info!(
            "Training on {} samples ({} steps per epoch), validating on {} samples",
            split.train.len(),
            steps,
            split.test.len()
        );

        let has_valid = !split.test.is_empty();
        let dataloader_train = train_loader::<B>(split.train, data, self.device.clone());
        let dataloader_valid =
            test_loader::<B::InnerBackend>(split.test, data, self.device.clone());

        let loss = self.config.loss.init::<B>(&self.device);
        let valid_loss = self.config.loss.init::<B::InnerBackend>(&self.device);
        let mut optim = self.config.optimizer.init::<B, UNet<B>>();
        let mut batches = RepeatingLoader::new(dataloader_train.as_ref());
        let mut early_stopping = self.config.early_stopping.as_ref().map(|config| {
            (config.init(), config.monitor.clone(), config.restore_best_weights)
        });
        // A record copies the batch-norm running statistics; a module clone
        // would keep sharing them with the model being trained.
        let mut best_record: Option<<UNet<B> as Module<B>>::Record> = None;
        let mut epochs = Vec::with_capacity(self.config.num_epochs);
        let mut stop_reason = StopReason::MaxEpochs;

        for epoch in 1..=self.config.num_epochs {
            let mut train_metrics = MetricAccumulator::new(num_classes);
            for _ in 0..steps {
                let batch = batches.next().ok_or(TrainingError::EmptyTrainingSet)?;
                let output = model.train_step_with(batch, &loss);

                train_metrics.update(&output.item)?;
                model = optim.step(self.config.learning_rate, model, output.grads);
            }

            let valid = if has_valid {
                Some(validate(
                    &model.valid(),
                    dataloader_valid.as_ref(),
                    valid_steps,
                    &valid_loss,
                )?)
            } else {
                None
            };

            let summary = EpochSummary {
                epoch,
                train: train_metrics.summary(),
                valid,
            };
            log_epoch(&summary, self.config.num_epochs);
            epochs.push(summary);

            for callback in self.callbacks.iter_mut() {
                callback.on_epoch_end(&summary, &model)?;
            }

            if let Some((stopping, monitor, restore)) = early_stopping.as_mut() {
                let Some(value) = monitor.value(&summary) else {
                    tracing::warn!("{} is not available, early stopping skipped", monitor.name());
                    continue;
                };

                match stopping.update(epoch, value) {
                    StoppingDecision::Improved if *restore => {
                        best_record = Some(model.clone().into_record())
                    }
                    StoppingDecision::Stop => {
                        tracing::info!(
                            "Early stopping at epoch {epoch}: {} has not improved since epoch {}",
                            monitor.name(),
                            stopping.best_epoch().unwrap_or(0)
                        );
                        stop_reason = StopReason::EarlyStopped { epoch };
                        break;
                    }
                    _ => {}
                }
            }
        }

        let mut best_epoch = epochs.last().map(|summary| summary.epoch);
        if let Some(record) = best_record {
            best_epoch = early_stopping
                .as_ref()
                .and_then(|(stopping, _, _)| stopping.best_epoch());
            tracing::info!(
                "Restoring model weights from the end of epoch {}",
                best_epoch.unwrap_or(0)
            );
            model = model.load_record(record);
        }

        let history = TrainingHistory {
            epochs,
            stop_reason,
            best_epoch,
        };
        for callback in self.callbacks.iter_mut() {
            callback.on_train_end(&history)?;
        }

        Ok(TrainingResult { model, history })
    }
}

/// Mean metrics over the first `steps` batches, or the whole loader when
/// `steps` is zero.
pub fn validate<B: Backend>(
    model: &UNet<B>,
    loader: &dyn DataLoader<SegmentationBatch<B>>,
    steps: usize,
    loss: &SegmentationCrossEntropyLoss<B>,
) -> Result<MetricSummary, TrainingError> {
    let limit = if steps == 0 { usize::MAX } else { steps };
    let mut metrics = MetricAccumulator::new(model.num_classes());

    for batch in loader.iter().take(limit) {
        let output = model.forward_segmentation_with(batch, loss);
        metrics.update(&output)?;
    }

    Ok(metrics.summary())
}

fn log_epoch(summary: &EpochSummary, num_epochs: usize) {
    let train = &summary.train;
    match &summary.valid {
        Some(valid) => tracing::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - mean_iou: {:.4} - val_loss: {:.4} - val_accuracy: {:.4} - val_mean_iou: {:.4}",
            summary.epoch,
            num_epochs,
            train.loss,
            train.accuracy,
            train.mean_iou,
            valid.loss,
            valid.accuracy,
            valid.mean_iou
        ),
        None => tracing::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - mean_iou: {:.4}",
            summary.epoch,
            num_epochs,
            train.loss,
            train.accuracy,
            train.mean_iou
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SegmentationItem;
    use crate::model::MobileNetV2Config;
    use crate::training::Monitor;
    use burn::backend::{Autodiff, NdArray};
    use std::sync::{Arc, Mutex};

    type TestBackend = Autodiff<NdArray>;

    fn item(index: usize) -> SegmentationItem {
        let [height, width] = [32, 32];
        let image = (0..height * width * 3)
            .map(|i| ((i + index) % 7) as f32 / 7.0)
            .collect();
        let mask = (0..height * width).map(|i| ((i / width) % 2) as u8).collect();

        SegmentationItem::new(format!("sample-{index}"), image, mask, [height, width])
    }

    fn config(num_epochs: usize) -> TrainingConfig {
        let model = UNetConfig::new()
            .with_input_size([32, 32])
            .with_num_classes(2)
            .with_decoder_filters([16, 8, 8, 8])
            .with_encoder(MobileNetV2Config::new().with_alpha(0.35));
        let data = DataConfig::new()
            .with_image_size([32, 32])
            .with_batch_size(2)
            .with_num_workers(1);

        TrainingConfig::new(model, data)
            .with_num_epochs(num_epochs)
            .with_early_stopping(Some(EarlyStoppingConfig::new()))
    }

    fn split(train: usize, test: usize) -> DatasetSplit {
        DatasetSplit {
            train: (0..train).map(item).collect(),
            test: (train..train + test).map(item).collect(),
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        epochs: Arc<Mutex<Vec<EpochSummary>>>,
        finished: Arc<Mutex<Option<TrainingHistory>>>,
    }

    impl<B: AutodiffBackend> TrainingCallback<B> for Recorder {
        fn on_epoch_end(
            &mut self,
            summary: &EpochSummary,
            _model: &UNet<B>,
        ) -> Result<(), TrainingError> {
            self.epochs.lock().unwrap().push(*summary);
            Ok(())
        }

        fn on_train_end(&mut self, history: &TrainingHistory) -> Result<(), TrainingError> {
            *self.finished.lock().unwrap() = Some(history.clone());
            Ok(())
        }
    }

    /// Keeps the inference output on a fixed input at the end of every epoch.
    #[derive(Clone, Default)]
    struct OutputRecorder {
        outputs: Arc<Mutex<Vec<TensorData>>>,
    }

    impl<B: AutodiffBackend> TrainingCallback<B> for OutputRecorder {
        fn on_epoch_end(
            &mut self,
            _summary: &EpochSummary,
            model: &UNet<B>,
        ) -> Result<(), TrainingError> {
            let images = Tensor::<B::InnerBackend, 4>::ones([1, 3, 32, 32], &Default::default());
            let output = model.valid().forward(images).into_data();
            self.outputs.lock().unwrap().push(output);
            Ok(())
        }
    }

    #[test]
    fn validation_steps_follow_subsplits() {
        assert_eq!(validation_steps(2, 16, 10), 0);
        assert_eq!(validation_steps(160, 16, 10), 1);
        assert_eq!(validation_steps(670, 16, 10), 4);
        assert_eq!(validation_steps(10, 0, 0), 10);
    }

    #[test]
    fn config_defaults() {
        let config = config(10);

        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.val_subsplits, 10);
        assert!(config.loss.weights.is_none() && config.loss.ignore_index.is_none());
        assert!(config.to_string().contains("\"loss\""));
        assert!(TrainingConfig::new(config.model.clone(), config.data.clone())
            .early_stopping
            .is_none());
        let early_stopping = config.early_stopping.unwrap();
        assert_eq!(early_stopping.patience, 5);
        assert_eq!(early_stopping.monitor, Monitor::TrainAccuracy);
        assert!(early_stopping.restore_best_weights);
    }

    #[test]
    fn runs_every_epoch_and_calls_back() {
        let device = Default::default();
        let config = config(2).with_early_stopping(None);
        let model = config.model.init::<TestBackend>(&device);
        let recorder = Recorder::default();

        let result = Trainer::<TestBackend>::new(config, device)
            .with_callback(recorder.clone())
            .fit(model, split(4, 2))
            .unwrap();

        let epochs = recorder.epochs.lock().unwrap();
        assert_eq!(epochs.len(), 2);
        assert!(epochs.iter().all(|summary| summary.valid.is_some()));
        assert!(epochs[0].train.loss.is_finite());
        assert_eq!(result.history.stop_reason, StopReason::MaxEpochs);
        assert_eq!(result.history.best_epoch, Some(2));
        assert_eq!(
            recorder.finished.lock().unwrap().as_ref(),
            Some(&result.history)
        );
    }

    #[test]
    fn stops_early_and_restores_best_epoch() {
        let device = Default::default();
        // With patience 1 on the training loss, a run stops at the first
        // epoch that fails to improve; the loop must never run all 50.
        let config = config(50).with_early_stopping(Some(
            EarlyStoppingConfig::new()
                .with_monitor(Monitor::TrainLoss)
                .with_patience(1)
                .with_min_delta(1e6),
        ));
        let model = config.model.init::<TestBackend>(&device);

        let result = Trainer::<TestBackend>::new(config, device)
            .fit(model, split(2, 0))
            .unwrap();

        assert_eq!(result.history.epochs.len(), 2);
        assert_eq!(
            result.history.stop_reason,
            StopReason::EarlyStopped { epoch: 2 }
        );
        assert_eq!(result.history.best_epoch, Some(1));
        assert!(result.history.epochs.iter().all(|e| e.valid.is_none()));
    }

    #[test]
    fn restores_the_weights_of_the_best_epoch() {
        let device = Default::default();
        // Only the first epoch can beat a min_delta this large, and patience
        // outlasts the run, so training ends after 3 epochs with epoch 1 best.
        let config = config(3).with_early_stopping(Some(
            EarlyStoppingConfig::new()
                .with_monitor(Monitor::TrainLoss)
                .with_patience(5)
                .with_min_delta(1e6),
        ));
        let model = config.model.init::<TestBackend>(&device);
        let recorder = OutputRecorder::default();

        let result = Trainer::<TestBackend>::new(config, device)
            .with_callback(recorder.clone())
            .fit(model, split(4, 2))
            .unwrap();

        assert_eq!(result.history.stop_reason, StopReason::MaxEpochs);
        assert_eq!(result.history.best_epoch, Some(1));

        let outputs = recorder.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 3);
        let images = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &device);
        let restored = result.model.valid().forward(images).into_data();

        restored.assert_approx_eq(&outputs[0], 5);
        assert_ne!(restored, outputs[2]);
    }

    #[test]
    fn image_size_must_match_the_model_input() {
        let device = Default::default();
        let mut config = config(1);
        config.data.image_size = [64, 64];
        let model = config.model.init::<TestBackend>(&device);

        let result = Trainer::<TestBackend>::new(config, device).fit(model, split(2, 0));

        assert!(matches!(
            result,
            Err(TrainingError::Model(ModelError::InputSizeMismatch {
                model: [32, 32],
                data: [64, 64],
            }))
        ));
    }

    #[test]
    fn class_weights_reach_training() {
        let device = Default::default();
        let config = config(1).with_early_stopping(None);

        let mismatched = config
            .clone()
            .with_loss(SegmentationCrossEntropyLossConfig::new().with_weights(Some(vec![1.0])));
        let model = mismatched.model.init::<TestBackend>(&device);
        let result = Trainer::<TestBackend>::new(mismatched, device).fit(model, split(2, 0));
        assert!(matches!(
            result,
            Err(TrainingError::InvalidLossWeights { expected: 2, .. })
        ));

        let weighted = config.with_loss(
            SegmentationCrossEntropyLossConfig::new()
                .with_weights(Some(vec![1.0, 3.0]))
                .with_ignore_index(Some(0)),
        );
        let model = weighted.model.init::<TestBackend>(&device);
        let result = Trainer::<TestBackend>::new(weighted, device)
            .fit(model, split(2, 2))
            .unwrap();

        let summary = result.history.epochs[0];
        assert!(summary.train.loss.is_finite());
        assert!(summary.valid.is_some_and(|valid| valid.loss.is_finite()));
    }

    #[test]
    fn empty_training_set_is_an_error() {
        let device = Default::default();
        let config = config(1);
        let model = config.model.init::<TestBackend>(&device);

        let result = Trainer::<TestBackend>::new(config, device).fit(model, split(0, 2));

        assert!(matches!(result, Err(TrainingError::EmptyTrainingSet)));
    }
}
