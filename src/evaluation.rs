//! Inference helpers: label maps, side-by-side prediction images and a
//! pixel-level evaluation report.

use std::fmt;
use std::path::{Path, PathBuf};

use burn::data::dataloader::{DataLoader, batcher::Batcher};
use burn::prelude::*;
use image::{Rgb, RgbImage, imageops};
use serde::{Deserialize, Serialize};

use crate::dataset::{SegmentationBatch, SegmentationBatcher, SegmentationItem};
use crate::model::UNet;
use crate::training::{
    ConfusionMatrix, MetricAccumulator, MetricSummary, SegmentationCrossEntropyLoss,
    SegmentationCrossEntropyLossConfig, TrainingError,
};

/// Gap between two panels of a rendered triplet.
const PANEL_GAP: u32 = 4;

/// Arg-max over the class axis: `[batch, classes, H, W]` logits to
/// `[batch, 1, H, W]` labels.
pub fn predict_labels<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 4, Int> {
    logits.argmax(1)
}

/// One sample with its true and predicted label maps, on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// HWC values in `[0, 1]`.
    pub image: Vec<f32>,
    pub true_mask: Vec<i64>,
    pub predicted_mask: Vec<i64>,
    /// `[height, width]`
    pub size: [usize; 2],
}

impl Prediction {
    /// First sample of a batch and of the logits the model produced for it.
    pub fn first_of<B: Backend>(
        batch: &SegmentationBatch<B>,
        logits: Tensor<B, 4>,
    ) -> Result<Self, TrainingError> {
        let [_, _, height, width] = batch.images.dims();

        let image = batch
            .images
            .clone()
            .slice([0..1])
            .squeeze::<3>(0)
            .permute([1, 2, 0])
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(tensor_data_error)?;
        let true_mask = labels(batch.masks.clone().slice([0..1]))?;
        let predicted_mask = labels(predict_labels(logits.slice([0..1])))?;

        Ok(Self {
            image,
            true_mask,
            predicted_mask,
            size: [height, width],
        })
    }

    /// Input image, true mask and predicted mask side by side.
    pub fn render(&self, num_classes: usize) -> RgbImage {
        let max_label = num_classes.saturating_sub(1).max(1) as i64;

        render_triplet(
            &image_panel(&self.image, self.size),
            &mask_panel(&self.true_mask, self.size, max_label),
            &mask_panel(&self.predicted_mask, self.size, max_label),
        )
    }
}

fn labels<B: Backend>(tensor: Tensor<B, 4, Int>) -> Result<Vec<i64>, TrainingError> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(tensor_data_error)
}

fn tensor_data_error(err: burn::tensor::DataError) -> TrainingError {
    TrainingError::TensorData(format!("{err:?}"))
}

/// HWC floats in `[0, 1]` to an RGB image.
pub fn image_panel(values: &[f32], size: [usize; 2]) -> RgbImage {
    let [height, width] = size;
    let mut panel = RgbImage::new(width as u32, height as u32);

    for (pixel, rgb) in panel.pixels_mut().zip(values.chunks_exact(3)) {
        *pixel = Rgb([to_u8(rgb[0]), to_u8(rgb[1]), to_u8(rgb[2])]);
    }

    panel
}

/// Label map as grayscale: 0 is black, `max_label` is white.
pub fn mask_panel(labels: &[i64], size: [usize; 2], max_label: i64) -> RgbImage {
    let [height, width] = size;
    let mut panel = RgbImage::new(width as u32, height as u32);

    for (pixel, &label) in panel.pixels_mut().zip(labels) {
        let value = to_u8(label.clamp(0, max_label) as f32 / max_label as f32);
        *pixel = Rgb([value, value, value]);
    }

    panel
}

fn to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Concatenate the input, true mask and predicted mask panels left to right.
pub fn render_triplet(image: &RgbImage, true_mask: &RgbImage, predicted_mask: &RgbImage) -> RgbImage {
    let panels = [image, true_mask, predicted_mask];
    let width = panels.iter().map(|panel| panel.width()).sum::<u32>() + 2 * PANEL_GAP;
    let height = panels.iter().map(|panel| panel.height()).max().unwrap_or(0);

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut x = 0;
    for panel in panels {
        imageops::replace(&mut canvas, panel, x as i64, 0);
        x += panel.width() + PANEL_GAP;
    }

    canvas
}

/// Predict a single item and render it.
pub fn render_item<B: Backend>(
    model: &UNet<B>,
    item: &SegmentationItem,
    device: &B::Device,
) -> Result<RgbImage, TrainingError> {
    let batch = SegmentationBatcher::<B>::new(device.clone()).batch(vec![item.clone()]);
    let logits = model.forward(batch.images.clone());

    Ok(Prediction::first_of(&batch, logits)?.render(model.num_classes()))
}

/// Render the first sample of up to `num` batches into
/// `<out_dir>/prediction-<n>.png`. Returns the written paths.
pub fn show_predictions<B: Backend>(
    model: &UNet<B>,
    loader: &dyn DataLoader<SegmentationBatch<B>>,
    num: usize,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, TrainingError> {
    std::fs::create_dir_all(out_dir).map_err(TrainingError::io(out_dir))?;

    let mut written = Vec::with_capacity(num);
    for (index, batch) in loader.iter().take(num).enumerate() {
        let logits = model.forward(batch.images.clone());
        let rendered = Prediction::first_of(&batch, logits)?.render(model.num_classes());

        let path = out_dir.join(format!("prediction-{index:03}.png"));
        rendered.save(&path)?;
        tracing::info!("Saved prediction to {}", path.display());
        written.push(path);
    }

    Ok(written)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub class: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub iou: Option<f64>,
    /// Labelled pixels.
    pub support: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub metrics: MetricSummary,
    pub confusion: ConfusionMatrix,
    pub classes: Vec<ClassReport>,
}

impl EvaluationReport {
    pub fn from_confusion(metrics: MetricSummary, confusion: ConfusionMatrix) -> Self {
        let classes = (0..confusion.num_classes())
            .map(|class| ClassReport {
                class,
                precision: confusion.precision(class),
                recall: confusion.recall(class),
                iou: confusion.iou(class),
                support: confusion.support(class),
            })
            .collect();

        Self {
            metrics,
            confusion,
            classes,
        }
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = |value: Option<f64>| match value {
            Some(value) => format!("{value:>9.4}"),
            None => format!("{:>9}", "-"),
        };

        writeln!(
            f,
            "loss: {:.4} - accuracy: {:.4} - mean_iou: {:.4}",
            self.metrics.loss, self.metrics.accuracy, self.metrics.mean_iou
        )?;
        writeln!(
            f,
            "{:>5} {:>9} {:>9} {:>9} {:>10}",
            "class", "precision", "recall", "iou", "support"
        )?;
        for class in &self.classes {
            writeln!(
                f,
                "{:>5} {} {} {} {:>10}",
                class.class,
                cell(class.precision),
                cell(class.recall),
                cell(class.iou),
                class.support
            )?;
        }

        Ok(())
    }
}

/// Loss, accuracy, mean IoU and confusion counts over a full pass of `loader`.
pub fn evaluate<B: Backend>(
    model: &UNet<B>,
    loader: &dyn DataLoader<SegmentationBatch<B>>,
) -> Result<EvaluationReport, TrainingError> {
    let device = model.devices().into_iter().next().unwrap_or_default();
    let loss = SegmentationCrossEntropyLossConfig::new().init(&device);

    evaluate_with(model, loader, &loss)
}

/// [evaluate] with the loss reported by `loss` instead of the plain cross entropy.
pub fn evaluate_with<B: Backend>(
    model: &UNet<B>,
    loader: &dyn DataLoader<SegmentationBatch<B>>,
    loss: &SegmentationCrossEntropyLoss<B>,
) -> Result<EvaluationReport, TrainingError> {
    let mut metrics = MetricAccumulator::new(model.num_classes());

    for batch in loader.iter() {
        metrics.update(&model.forward_segmentation_with(batch, loss))?;
    }

    let summary = metrics.summary();
    Ok(EvaluationReport::from_confusion(summary, metrics.into_confusion()))
}
