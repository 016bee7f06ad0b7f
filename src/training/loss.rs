//! Pixel-wise cross entropy for segmentation logits.
//!
//! Built on the same reshaping as burn's `CrossEntropyLoss`: every pixel of a
//! `[batch, classes, height, width]` prediction becomes one row of a
//! `[pixels, classes]` matrix, so the log-softmax and the negative
//! log-likelihood are computed in one fused pass.

use burn::{
    module::{Content, DisplaySettings, ModuleDisplay},
    prelude::*,
    tensor::activation::log_softmax,
};

/// Configuration to create a [SegmentationCrossEntropyLoss] using the
/// [init function](SegmentationCrossEntropyLossConfig::init).
#[derive(Config, Debug)]
pub struct SegmentationCrossEntropyLossConfig {
    /// Create weighted cross-entropy.
    ///
    /// The loss of every pixel is multiplied by the weight of its label, and
    /// the mean is taken over the summed weights.
    ///
    /// # Pre-conditions
    ///   - The order of the weight vector should correspond to the label integer assignment.
    ///   - All weights are positive.
    pub weights: Option<Vec<f32>>,

    /// Predictions are raw logits (true) or probabilities (false).
    #[config(default = true)]
    pub logits: bool,

    /// Pixels carrying this label do not contribute to the loss.
    pub ignore_index: Option<usize>,
}

impl SegmentationCrossEntropyLossConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegmentationCrossEntropyLoss<B> {
        self.assertions();
        SegmentationCrossEntropyLoss {
            weights: self
                .weights
                .as_ref()
                .map(|e| Tensor::<B, 1>::from_floats(e.as_slice(), device)),
            logits: self.logits,
            ignore_index: self.ignore_index,
        }
    }

    fn assertions(&self) {
        if let Some(weights) = self.weights.as_ref() {
            assert!(
                weights.iter().all(|e| e > &0.),
                "Weights of cross-entropy have to be positive."
            );
        }
    }
}

/// Mean cross entropy over all pixels of a batch.
///
/// Should be created using [SegmentationCrossEntropyLossConfig].
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct SegmentationCrossEntropyLoss<B: Backend> {
    /// Weights for cross-entropy.
    pub weights: Option<Tensor<B, 1>>,
    /// Use logits as input.
    pub logits: bool,
    /// Label excluded from the loss.
    pub ignore_index: Option<usize>,
}

impl<B: Backend> ModuleDisplay for SegmentationCrossEntropyLoss<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("weights", &self.weights)
            .add("logits", &self.logits)
            .add("ignore_index", &self.ignore_index)
            .optional()
    }
}

impl<B: Backend> SegmentationCrossEntropyLoss<B> {
    /// Compute the criterion on the input tensor.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, 1, height, width]` (integer class indices)
    pub fn forward(&self, predictions: Tensor<B, 4>, targets: Tensor<B, 4, Int>) -> Tensor<B, 1> {
        Self::assertions(&predictions, &targets);

        let [batch_size, num_classes, height, width] = predictions.dims();
        let num_pixels = batch_size * height * width;

        let predictions = predictions
            .permute([0, 2, 3, 1])
            .reshape([num_pixels, num_classes]);
        let targets = targets.reshape([num_pixels]);

        let log_probs = if self.logits {
            log_softmax(predictions, 1)
        } else {
            predictions.log()
        };

        let neg_log_likelihood = log_probs
            .gather(1, targets.clone().reshape([num_pixels, 1]))
            .reshape([num_pixels])
            .neg();

        let mut pixel_weights = match &self.weights {
            Some(weights) => weights.clone().gather(0, targets.clone()),
            None => neg_log_likelihood.ones_like(),
        };
        if let Some(ignore_index) = self.ignore_index {
            pixel_weights = pixel_weights.mask_fill(targets.equal_elem(ignore_index as i64), 0.0);
        }

        let total_weight = pixel_weights.clone().sum().clamp_min(1e-12);

        (neg_log_likelihood * pixel_weights).sum() / total_weight
    }

    fn assertions(predictions: &Tensor<B, 4>, targets: &Tensor<B, 4, Int>) {
        let [pred_batch, _pred_classes, pred_height, pred_width] = predictions.dims();
        let [target_batch, target_channels, target_height, target_width] = targets.dims();

        assert_eq!(
            pred_batch, target_batch,
            "Batch size mismatch: predictions ({}) vs targets ({})",
            pred_batch, target_batch
        );

        assert_eq!(
            target_channels, 1,
            "Target should have exactly 1 channel, got {}",
            target_channels
        );

        assert_eq!(
            pred_height, target_height,
            "Height mismatch: predictions ({}) vs targets ({})",
            pred_height, target_height
        );

        assert_eq!(
            pred_width, target_width,
            "Width mismatch: predictions ({}) vs targets ({})",
            pred_width, target_width
        );
    }
}
