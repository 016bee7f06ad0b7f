use burn::prelude::*;

use super::EpochSummary;

/// Which epoch metric early stopping watches.
#[derive(Config, Debug, PartialEq)]
pub enum Monitor {
    TrainAccuracy,
    TrainLoss,
    TrainMeanIoU,
    ValidAccuracy,
    ValidLoss,
    ValidMeanIoU,
}

impl Monitor {
    /// Losses improve downwards, everything else upwards.
    pub fn maximize(&self) -> bool {
        !matches!(self, Monitor::TrainLoss | Monitor::ValidLoss)
    }

    /// `None` for a validation metric when the run has no validation pass.
    pub fn value(&self, summary: &EpochSummary) -> Option<f64> {
        match self {
            Monitor::TrainAccuracy => Some(summary.train.accuracy),
            Monitor::TrainLoss => Some(summary.train.loss),
            Monitor::TrainMeanIoU => Some(summary.train.mean_iou),
            Monitor::ValidAccuracy => summary.valid.map(|valid| valid.accuracy),
            Monitor::ValidLoss => summary.valid.map(|valid| valid.loss),
            Monitor::ValidMeanIoU => summary.valid.map(|valid| valid.mean_iou),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Monitor::TrainAccuracy => "train/accuracy",
            Monitor::TrainLoss => "train/loss",
            Monitor::TrainMeanIoU => "train/mean_iou",
            Monitor::ValidAccuracy => "valid/accuracy",
            Monitor::ValidLoss => "valid/loss",
            Monitor::ValidMeanIoU => "valid/mean_iou",
        }
    }
}

#[derive(Config, Debug)]
pub struct EarlyStoppingConfig {
    #[config(default = "Monitor::TrainAccuracy")]
    pub monitor: Monitor,
    /// Epochs without improvement before the run stops.
    #[config(default = "5")]
    pub patience: usize,
    /// Smallest change that counts as an improvement.
    #[config(default = "0.0")]
    pub min_delta: f64,
    /// Put the weights of the best epoch back into the model when training ends.
    #[config(default = "true")]
    pub restore_best_weights: bool,
}

impl EarlyStoppingConfig {
    pub fn init(&self) -> EarlyStopping {
        assert!(
            self.min_delta >= 0.0,
            "The early stopping delta has to be non-negative."
        );

        EarlyStopping {
            patience: self.patience,
            min_delta: self.min_delta,
            maximize: self.monitor.maximize(),
            best: None,
            best_epoch: None,
            wait: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    /// New best value.
    Improved,
    Continue,
    Stop,
}

/// Tracks the best monitored value and the number of epochs since it was
/// reached.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    maximize: bool,
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn update(&mut self, epoch: usize, value: f64) -> StoppingDecision {
        let improved = match self.best {
            None => !value.is_nan(),
            Some(best) if self.maximize => value - self.min_delta > best,
            Some(best) => value + self.min_delta < best,
        };

        if improved {
            self.best = Some(value);
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StoppingDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::Continue
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Epochs since the last improvement.
    pub fn wait(&self) -> usize {
        self.wait
    }
}
