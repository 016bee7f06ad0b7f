use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};

use super::{EpochSummary, MetricSummary, TrainingError, TrainingHistory};
use crate::dataset::SegmentationItem;
use crate::evaluation::render_item;
use crate::model::UNet;

pub const TRAIN_DIR: &str = "train";
pub const VALID_DIR: &str = "valid";
pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const HISTORY_FILE: &str = "history.json";

/// Hooks run by the [Trainer](super::Trainer) between epochs.
pub trait TrainingCallback<B: AutodiffBackend> {
    fn on_epoch_end(&mut self, summary: &EpochSummary, model: &UNet<B>)
    -> Result<(), TrainingError>;

    fn on_train_end(&mut self, _history: &TrainingHistory) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub epoch: usize,
    pub tag: String,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Appends epoch scalars under `<log_root>/<YYYYmmdd-HHMMSS>/{train,valid}`
/// and writes the run history once training ends.
#[derive(Debug, Clone)]
pub struct ScalarLogger {
    run_dir: PathBuf,
}

impl ScalarLogger {
    /// Create a run directory named after the current local time.
    pub fn new<P: AsRef<Path>>(log_root: P) -> Result<Self, TrainingError> {
        let run = Local::now().format("%Y%m%d-%H%M%S").to_string();

        Self::in_dir(log_root.as_ref().join(run))
    }

    pub fn in_dir(run_dir: PathBuf) -> Result<Self, TrainingError> {
        for split in [TRAIN_DIR, VALID_DIR] {
            let dir = run_dir.join(split);
            std::fs::create_dir_all(&dir).map_err(TrainingError::io(&dir))?;
        }
        tracing::info!("Writing training summaries to {}", run_dir.display());

        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn append(&self, split: &str, epoch: usize, metrics: &MetricSummary) -> Result<(), TrainingError> {
        let path = self.run_dir.join(split).join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(TrainingError::io(&path))?;
        let mut writer = BufWriter::new(file);

        let wall_time = Utc::now().timestamp_millis() as f64 / 1000.0;
        let scalars = [
            ("epoch_loss", metrics.loss),
            ("epoch_accuracy", metrics.accuracy),
            ("epoch_mean_iou", metrics.mean_iou),
        ];
        for (tag, value) in scalars {
            let event = ScalarEvent {
                epoch,
                tag: tag.to_string(),
                value,
                wall_time,
            };
            serde_json::to_writer(&mut writer, &event)?;
            writeln!(writer).map_err(TrainingError::io(&path))?;
        }

        writer.flush().map_err(TrainingError::io(&path))
    }
}

impl<B: AutodiffBackend> TrainingCallback<B> for ScalarLogger {
    fn on_epoch_end(
        &mut self,
        summary: &EpochSummary,
        _model: &UNet<B>,
    ) -> Result<(), TrainingError> {
        self.append(TRAIN_DIR, summary.epoch, &summary.train)?;
        if let Some(valid) = &summary.valid {
            self.append(VALID_DIR, summary.epoch, valid)?;
        }

        Ok(())
    }

    fn on_train_end(&mut self, history: &TrainingHistory) -> Result<(), TrainingError> {
        let path = self.run_dir.join(HISTORY_FILE);
        let file = File::create(&path).map_err(TrainingError::io(&path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), history)?;

        Ok(())
    }
}

/// Renders the prediction for a fixed sample after every epoch into
/// `<out_dir>/epoch-<n>.png`.
#[derive(Debug, Clone)]
pub struct PredictionDisplay {
    sample: SegmentationItem,
    out_dir: PathBuf,
}

impl PredictionDisplay {
    pub fn new<P: AsRef<Path>>(sample: SegmentationItem, out_dir: P) -> Result<Self, TrainingError> {
        let out_dir = out_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&out_dir).map_err(TrainingError::io(&out_dir))?;

        Ok(Self { sample, out_dir })
    }
}

impl<B: AutodiffBackend> TrainingCallback<B> for PredictionDisplay {
    fn on_epoch_end(&mut self, summary: &EpochSummary, model: &UNet<B>) -> Result<(), TrainingError> {
        let model = model.valid();
        let device = model.devices().into_iter().next().unwrap_or_default();

        let rendered = render_item(&model, &self.sample, &device)?;
        let path = self.out_dir.join(format!("epoch-{:03}.png", summary.epoch));
        rendered.save(&path)?;

        tracing::info!(
            "Sample prediction for {} after epoch {}: {}",
            self.sample.name,
            summary.epoch,
            path.display()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MobileNetV2Config, UNetConfig};
    use crate::training::StopReason;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn summary(epoch: usize, valid: bool) -> EpochSummary {
        let metrics = MetricSummary {
            loss: 0.5,
            accuracy: 0.75,
            mean_iou: 0.25,
        };

        EpochSummary {
            epoch,
            train: metrics,
            valid: valid.then_some(metrics),
        }
    }

    fn model() -> UNet<TestBackend> {
        UNetConfig::new()
            .with_input_size([32, 32])
            .with_decoder_filters([16, 8, 8, 8])
            .with_encoder(MobileNetV2Config::new().with_alpha(0.35))
            .init(&Default::default())
    }

    fn read_events(path: &Path) -> Vec<ScalarEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn run_directory_is_timestamped() {
        let root = tempfile::tempdir().unwrap();

        let logger = ScalarLogger::new(root.path()).unwrap();
        let name = logger.run_dir().file_name().unwrap().to_string_lossy().into_owned();

        assert_eq!(name.len(), "YYYYmmdd-HHMMSS".len());
        assert_eq!(name.as_bytes()[8], b'-');
        assert!(logger.run_dir().join(TRAIN_DIR).is_dir());
        assert!(logger.run_dir().join(VALID_DIR).is_dir());
    }

    #[test]
    fn scalars_are_appended_per_epoch() {
        let root = tempfile::tempdir().unwrap();
        let mut logger = ScalarLogger::in_dir(root.path().join("run")).unwrap();
        let model = model();

        TrainingCallback::<TestBackend>::on_epoch_end(&mut logger, &summary(1, true), &model)
            .unwrap();
        TrainingCallback::<TestBackend>::on_epoch_end(&mut logger, &summary(2, false), &model)
            .unwrap();

        let train = read_events(&logger.run_dir().join(TRAIN_DIR).join(SCALARS_FILE));
        let valid = read_events(&logger.run_dir().join(VALID_DIR).join(SCALARS_FILE));

        assert_eq!(train.len(), 6);
        assert_eq!(valid.len(), 3);
        assert_eq!(train[0].tag, "epoch_loss");
        assert_eq!(train[4].epoch, 2);
        assert_eq!(train[4].tag, "epoch_accuracy");
        assert_eq!(train[4].value, 0.75);
        assert!(train[0].wall_time > 0.0);
    }

    #[test]
    fn history_is_written_at_the_end() {
        let root = tempfile::tempdir().unwrap();
        let mut logger = ScalarLogger::in_dir(root.path().join("run")).unwrap();
        let history = TrainingHistory {
            epochs: vec![summary(1, false)],
            stop_reason: StopReason::MaxEpochs,
            best_epoch: Some(1),
        };

        TrainingCallback::<TestBackend>::on_train_end(&mut logger, &history).unwrap();

        let written: TrainingHistory = serde_json::from_str(
            &std::fs::read_to_string(logger.run_dir().join(HISTORY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written, history);
    }

    #[test]
    fn prediction_display_renders_each_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let sample = SegmentationItem::new(
            "sample".to_string(),
            vec![0.5; 32 * 32 * 3],
            vec![1; 32 * 32],
            [32, 32],
        );
        let mut display = PredictionDisplay::new(sample, dir.path().join("predictions")).unwrap();
        let model = model();

        for epoch in 1..=2 {
            TrainingCallback::<TestBackend>::on_epoch_end(&mut display, &summary(epoch, false), &model)
                .unwrap();
        }

        assert!(dir.path().join("predictions/epoch-001.png").exists());
        assert!(dir.path().join("predictions/epoch-002.png").exists());
    }
}
