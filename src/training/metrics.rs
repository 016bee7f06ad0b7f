use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::{SegmentationOutput, TrainingError};

/// Pixel-level confusion counts. Rows are true labels, columns predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Count the arg-max predictions of `logits` (`[batch, classes, H, W]`)
    /// against `targets` (`[batch, 1, H, W]`).
    pub fn update<B: Backend>(
        &mut self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 4, Int>,
    ) -> Result<(), TrainingError> {
        let predicted = int_values(logits.argmax(1))?;
        let truth = int_values(targets)?;

        self.update_labels(&predicted, &truth);
        Ok(())
    }

    /// Labels outside `0..num_classes` are skipped.
    pub fn update_labels(&mut self, predicted: &[i64], truth: &[i64]) {
        let n = self.num_classes as i64;

        for (&p, &t) in predicted.iter().zip(truth) {
            if (0..n).contains(&p) && (0..n).contains(&t) {
                self.counts[(t * n + p) as usize] += 1;
            }
        }
    }

    pub fn count(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.num_classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn true_positives(&self, class: usize) -> u64 {
        self.count(class, class)
    }

    /// Pixels labelled `class`.
    pub fn support(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|p| self.count(class, p)).sum()
    }

    /// Pixels predicted as `class`.
    pub fn predicted(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|t| self.count(t, class)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }

        let correct: u64 = (0..self.num_classes).map(|c| self.true_positives(c)).sum();
        correct as f64 / total as f64
    }

    /// `None` when the class appears neither in the labels nor in the predictions.
    pub fn iou(&self, class: usize) -> Option<f64> {
        let intersection = self.true_positives(class);
        let union = self.support(class) + self.predicted(class) - intersection;

        (union > 0).then(|| intersection as f64 / union as f64)
    }

    /// Mean IoU over the classes that occur.
    pub fn mean_iou(&self) -> f64 {
        let ious: Vec<f64> = (0..self.num_classes).filter_map(|c| self.iou(c)).collect();

        if ious.is_empty() {
            0.0
        } else {
            ious.iter().sum::<f64>() / ious.len() as f64
        }
    }

    pub fn precision(&self, class: usize) -> Option<f64> {
        let predicted = self.predicted(class);

        (predicted > 0).then(|| self.true_positives(class) as f64 / predicted as f64)
    }

    pub fn recall(&self, class: usize) -> Option<f64> {
        let support = self.support(class);

        (support > 0).then(|| self.true_positives(class) as f64 / support as f64)
    }

    pub fn merge(&mut self, other: &ConfusionMatrix) {
        assert_eq!(
            self.num_classes, other.num_classes,
            "Cannot merge confusion matrices of different sizes"
        );

        for (count, other) in self.counts.iter_mut().zip(&other.counts) {
            *count += other;
        }
    }
}

fn int_values<B: Backend>(tensor: Tensor<B, 4, Int>) -> Result<Vec<i64>, TrainingError> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| TrainingError::TensorData(format!("{err:?}")))
}

/// Loss, pixel accuracy and mean IoU of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub mean_iou: f64,
}

/// Running loss mean (weighted by batch size) and confusion counts.
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    loss_sum: f64,
    samples: usize,
    confusion: ConfusionMatrix,
}

impl MetricAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            loss_sum: 0.0,
            samples: 0,
            confusion: ConfusionMatrix::new(num_classes),
        }
    }

    pub fn update<B: Backend>(&mut self, item: &SegmentationOutput<B>) -> Result<(), TrainingError> {
        let batch_size = item.targets.dims()[0];
        let loss = item.loss.clone().into_scalar().elem::<f64>();

        self.loss_sum += loss * batch_size as f64;
        self.samples += batch_size;
        self.confusion
            .update(item.output.clone(), item.targets.clone())
    }

    pub fn confusion(&self) -> &ConfusionMatrix {
        &self.confusion
    }

    pub fn into_confusion(self) -> ConfusionMatrix {
        self.confusion
    }

    pub fn summary(&self) -> MetricSummary {
        let loss = if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        };

        MetricSummary {
            loss,
            accuracy: self.confusion.accuracy(),
            mean_iou: self.confusion.mean_iou(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn counts_argmax_predictions() {
        let device = Default::default();
        // Pixels predict classes [1, 0, 1, 1]; labels are [1, 0, 0, 1].
        let logits = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.0, 2.0, 0.0, 0.0]], [[3.0, 1.0, 4.0, 5.0]]]],
            &device,
        );
        let targets = Tensor::<TestBackend, 4, Int>::from_ints([[[[1, 0, 0, 1]]]], &device);

        let mut matrix = ConfusionMatrix::new(2);
        matrix.update(logits, targets).unwrap();

        assert_eq!(matrix.count(0, 0), 1);
        assert_eq!(matrix.count(0, 1), 1);
        assert_eq!(matrix.count(1, 1), 2);
        assert_eq!(matrix.count(1, 0), 0);
        assert_eq!(matrix.total(), 4);
        assert!((matrix.accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn iou_precision_and_recall() {
        let mut matrix = ConfusionMatrix::new(3);
        matrix.update_labels(&[1, 0, 1, 1], &[1, 0, 0, 1]);

        // class 0: tp 1, fn 1, fp 0 -> IoU 1/2
        // class 1: tp 2, fp 1, fn 0 -> IoU 2/3
        // class 2 never occurs and is left out of the mean.
        assert_eq!(matrix.iou(0), Some(0.5));
        assert!((matrix.iou(1).unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(matrix.iou(2), None);
        assert!((matrix.mean_iou() - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);

        assert_eq!(matrix.precision(0), Some(1.0));
        assert_eq!(matrix.recall(0), Some(0.5));
        assert!((matrix.precision(1).unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(matrix.recall(1), Some(1.0));
        assert_eq!(matrix.precision(2), None);
    }

    #[test]
    fn out_of_range_labels_are_skipped() {
        let mut matrix = ConfusionMatrix::new(2);
        matrix.update_labels(&[0, 2, 1], &[0, 1, 5]);

        assert_eq!(matrix.total(), 1);
    }

    #[test]
    fn merged_counts_add_up() {
        let mut a = ConfusionMatrix::new(2);
        a.update_labels(&[0, 1], &[0, 1]);
        let mut b = ConfusionMatrix::new(2);
        b.update_labels(&[1, 1], &[0, 1]);

        a.merge(&b);

        assert_eq!(a.count(1, 1), 2);
        assert_eq!(a.count(0, 1), 1);
        assert!((a.accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn accumulator_weights_loss_by_batch_size() {
        let device = Default::default();
        let item = |loss: f32, batch: usize| {
            SegmentationOutput::<TestBackend>::new(
                Tensor::from_floats([loss], &device),
                Tensor::zeros([batch, 2, 1, 1], &device),
                Tensor::zeros([batch, 1, 1, 1], &device),
            )
        };

        let mut accumulator = MetricAccumulator::new(2);
        accumulator.update(&item(1.0, 3)).unwrap();
        accumulator.update(&item(3.0, 1)).unwrap();
        let summary = accumulator.summary();

        assert!((summary.loss - 1.5).abs() < 1e-6);
        // Zero logits arg-max to class 0, which matches every label.
        assert_eq!(summary.accuracy, 1.0);
        assert_eq!(summary.mean_iou, 1.0);
    }

    #[test]
    fn empty_accumulator_reports_zeros() {
        let summary = MetricAccumulator::new(3).summary();

        assert_eq!(summary.loss, 0.0);
        assert_eq!(summary.accuracy, 0.0);
        assert_eq!(summary.mean_iou, 0.0);
    }
}
