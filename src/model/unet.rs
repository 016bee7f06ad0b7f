use std::path::Path;

use burn::{
    module::AutodiffModule,
    nn::conv::{ConvTranspose2d, ConvTranspose2dConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};

#[cfg(feature = "training")]
use crate::{
    dataset::SegmentationBatch,
    training::{
        SegmentationOutput,
        loss::{SegmentationCrossEntropyLoss, SegmentationCrossEntropyLossConfig},
    },
};
#[cfg(feature = "training")]
use burn::train::{TrainOutput, TrainStep, ValidStep};

use super::ModelError;
use super::blocks::{UpsampleBlock, UpsampleBlockConfig, same_transposed_padding};
use super::encoder::{EncoderFeatures, MobileNetV2, MobileNetV2Config, OUTPUT_STRIDE};

/// File stem of the saved weights (the recorder appends `.mpk`).
pub const MODEL_FILE: &str = "model";
/// Architecture saved next to the weights.
pub const MODEL_CONFIG_FILE: &str = "model.json";

/// U-Net with a frozen MobileNetV2 encoder and a pix2pix-style decoder.
///
/// Maps `[batch, 3, H, W]` images to `[batch, num_classes, H, W]` logits.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    encoder: MobileNetV2<B>,
    up_stack: Vec<UpsampleBlock<B>>,
    output: ConvTranspose2d<B>,
    num_classes: usize,
}

#[derive(Config, Debug)]
pub struct UNetConfig {
    #[config(default = "[128, 128]")]
    pub input_size: [usize; 2],
    /// Output channels. Kept at 3 by default although the masks are binary.
    #[config(default = "3")]
    pub num_classes: usize,
    #[config(default = "[512, 256, 128, 64]")]
    pub decoder_filters: [usize; 4],
    #[config(default = "3")]
    pub kernel_size: usize,
    pub decoder_dropout: Option<f64>,
    #[config(default = "MobileNetV2Config::new()")]
    pub encoder: MobileNetV2Config,
}

impl UNetConfig {
    /// Check that every encoder stage divides the input evenly, so skip
    /// connections line up with the upsampled maps.
    pub fn validate(&self) -> Result<(), ModelError> {
        let valid = self
            .input_size
            .iter()
            .all(|&side| side > 0 && side % OUTPUT_STRIDE == 0);

        if !valid {
            return Err(ModelError::InvalidInputSize(self.input_size, OUTPUT_STRIDE));
        }
        if self.num_classes == 0 {
            return Err(ModelError::InvalidClassCount);
        }

        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let [c1, c2, c3, c4, c5] = self.encoder.feature_channels();
        let encoder = self.encoder.init(device).no_grad();

        let mut channels = c5;
        let mut up_stack = Vec::with_capacity(self.decoder_filters.len());
        for (filters, skip_channels) in self.decoder_filters.iter().zip([c4, c3, c2, c1]) {
            up_stack.push(
                UpsampleBlockConfig::new(channels, *filters)
                    .with_kernel_size(self.kernel_size)
                    .with_dropout(self.decoder_dropout)
                    .init(device),
            );
            channels = filters + skip_channels;
        }

        let (padding, padding_out) = same_transposed_padding(self.kernel_size);

        UNet {
            encoder,
            up_stack,
            output: ConvTranspose2dConfig::new(
                [channels, self.num_classes],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([2, 2])
            .with_padding([padding, padding])
            .with_padding_out([padding_out, padding_out])
            .init(device),
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> UNet<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self.encoder.forward_features(images);

        self.decode(features)
    }

    /// Upsampling path: each stage doubles the resolution and concatenates
    /// the matching encoder map, then the output layer restores full size.
    pub fn decode(&self, features: EncoderFeatures<B>) -> Tensor<B, 4> {
        let (x, skips) = features.into_decoder_inputs();

        let x = self
            .up_stack
            .iter()
            .zip(skips)
            .fold(x, |x, (up, skip)| up.forward_skip(x, skip));

        self.output.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn encoder(&self) -> &MobileNetV2<B> {
        &self.encoder
    }

    /// Replace the encoder weights with pretrained ones. The encoder stays frozen.
    pub fn with_pretrained_encoder<P: AsRef<Path>>(
        mut self,
        path: P,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        self.encoder = self.encoder.load_pretrained(path, device)?.no_grad();

        Ok(self)
    }

    /// Write weights and architecture into `directory`.
    pub fn save(self, config: &UNetConfig, directory: &Path) -> Result<(), ModelError> {
        std::fs::create_dir_all(directory)?;
        config.save(directory.join(MODEL_CONFIG_FILE))?;

        let path = directory.join(MODEL_FILE);
        self.save_file(path.clone(), &CompactRecorder::new())
            .map_err(|err| ModelError::Weights {
                path,
                reason: err.to_string(),
            })
    }

    /// Rebuild a model saved with [UNet::save].
    pub fn load(directory: &Path, device: &B::Device) -> Result<(UNetConfig, Self), ModelError> {
        let config_path = directory.join(MODEL_CONFIG_FILE);
        let config = UNetConfig::load(&config_path).map_err(|err| ModelError::Config {
            path: config_path,
            reason: err.to_string(),
        })?;
        config.validate()?;

        let path = directory.join(MODEL_FILE);
        let model = config
            .init(device)
            .load_file(path.clone(), &CompactRecorder::new(), device)
            .map_err(|err| ModelError::Weights {
                path,
                reason: err.to_string(),
            })?;

        Ok((config, model))
    }
}

impl<B: AutodiffBackend> UNet<B> {
    /// Forward pass with the encoder evaluated on the inner backend: no
    /// gradient reaches it and its batch norms use their running statistics.
    pub fn forward_frozen(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self.encoder.valid().forward_features(images.inner());

        self.decode(features.map(Tensor::<B, 4>::from_inner))
    }
}

#[cfg(feature = "training")]
impl<B: Backend> UNet<B> {
    /// Forward pass scored with the plain, unweighted cross entropy.
    pub fn forward_segmentation(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        let loss = SegmentationCrossEntropyLossConfig::new().init(&batch.images.device());

        self.forward_segmentation_with(batch, &loss)
    }

    pub fn forward_segmentation_with(
        &self,
        batch: SegmentationBatch<B>,
        loss: &SegmentationCrossEntropyLoss<B>,
    ) -> SegmentationOutput<B> {
        let output = self.forward(batch.images);

        segmentation_output(loss, output, batch.masks)
    }
}

#[cfg(feature = "training")]
impl<B: AutodiffBackend> UNet<B> {
    /// One optimization step worth of gradients, with the encoder frozen.
    pub fn train_step_with(
        &self,
        batch: SegmentationBatch<B>,
        loss: &SegmentationCrossEntropyLoss<B>,
    ) -> TrainOutput<SegmentationOutput<B>> {
        let output = self.forward_frozen(batch.images);
        let item = segmentation_output(loss, output, batch.masks);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "training")]
fn segmentation_output<B: Backend>(
    loss: &SegmentationCrossEntropyLoss<B>,
    output: Tensor<B, 4>,
    targets: Tensor<B, 4, Int>,
) -> SegmentationOutput<B> {
    let loss = loss.forward(output.clone(), targets.clone());

    SegmentationOutput::new(loss, output, targets)
}

#[cfg(feature = "training")]
impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let loss = SegmentationCrossEntropyLossConfig::new().init(&batch.images.device());

        self.train_step_with(batch, &loss)
    }
}

#[cfg(feature = "training")]
impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}
