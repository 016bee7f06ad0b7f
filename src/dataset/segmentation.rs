use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator, batcher::Batcher};
use burn::data::dataset::InMemDataset;
use burn::prelude::*;
use derive_new::new;
use serde::{Deserialize, Serialize};

use super::{DataConfig, HorizontalFlip};

/// One preprocessed sample.
#[derive(new, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentationItem {
    /// File stem the sample was loaded from.
    pub name: String,
    /// `height * width * 3` values in `[0, 1]`, row-major HWC.
    pub image: Vec<f32>,
    /// `height * width` labels in `{0, 1}`.
    pub mask: Vec<u8>,
    /// `[height, width]`
    pub size: [usize; 2],
}

#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4, Float>,
    /// `[batch, 1, height, width]`
    pub masks: Tensor<B, 4, Int>,
}

#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
    augmentation: Option<HorizontalFlip>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            augmentation: None,
        }
    }

    pub fn with_augmentation(mut self, augmentation: HorizontalFlip) -> Self {
        self.augmentation = Some(augmentation);
        self
    }
}

impl<B: Backend> Batcher<SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());

        for item in items {
            let item = match &self.augmentation {
                Some(augmentation) => augmentation.apply(item),
                None => item,
            };
            let [height, width] = item.size;

            let image = Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [height, width, 3]).convert::<B::FloatElem>(),
                &self.device,
            )
            .permute([2, 0, 1]);

            let labels: Vec<i64> = item.mask.into_iter().map(i64::from).collect();
            let mask = Tensor::<B, 3, Int>::from_data(
                TensorData::new(labels, [1, height, width]).convert::<B::IntElem>(),
                &self.device,
            );

            images.push(image);
            masks.push(mask);
        }

        SegmentationBatch {
            images: Tensor::stack::<4>(images, 0),
            masks: Tensor::stack::<4>(masks, 0),
        }
    }
}

/// Shuffled, augmented training batches.
pub fn train_loader<B: Backend>(
    items: Vec<SegmentationItem>,
    config: &DataConfig,
    device: B::Device,
) -> Arc<dyn DataLoader<SegmentationBatch<B>>> {
    let mut batcher = SegmentationBatcher::<B>::new(device);
    if config.augment {
        batcher = batcher.with_augmentation(HorizontalFlip::new(
            config.flip_probability,
            config.seed,
        ));
    }

    DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(InMemDataset::new(items))
}

/// One ordered pass over the held-out samples, without augmentation.
pub fn test_loader<B: Backend>(
    items: Vec<SegmentationItem>,
    config: &DataConfig,
    device: B::Device,
) -> Arc<dyn DataLoader<SegmentationBatch<B>>> {
    DataLoaderBuilder::new(SegmentationBatcher::<B>::new(device))
        .batch_size(config.batch_size)
        .build(InMemDataset::new(items))
}

/// Batches per training epoch: `floor(len / batch_size)`, at least one as
/// long as there is data.
pub fn steps_per_epoch(len: usize, batch_size: usize) -> usize {
    if len == 0 {
        return 0;
    }

    (len / batch_size.max(1)).max(1)
}

/// Endless stream over a data loader, starting a new pass (and a new
/// shuffle) whenever the previous one is exhausted.
pub struct RepeatingLoader<'a, O> {
    loader: &'a dyn DataLoader<O>,
    current: Box<dyn DataLoaderIterator<O> + 'a>,
    passes: usize,
}

impl<'a, O> RepeatingLoader<'a, O> {
    pub fn new(loader: &'a dyn DataLoader<O>) -> Self {
        Self {
            loader,
            current: loader.iter(),
            passes: 1,
        }
    }

    /// Number of passes started so far.
    pub fn passes(&self) -> usize {
        self.passes
    }
}

impl<O> Iterator for RepeatingLoader<'_, O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if let Some(item) = self.current.next() {
            return Some(item);
        }

        self.current = self.loader.iter();
        self.passes += 1;
        self.current.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn item(value: u8) -> SegmentationItem {
        let [height, width] = [4, 6];
        SegmentationItem::new(
            format!("item-{value}"),
            vec![value as f32 / 255.0; height * width * 3],
            (0..height * width).map(|i| (i % 2) as u8).collect(),
            [height, width],
        )
    }

    #[test]
    fn batch_is_channels_first() {
        let device = Default::default();
        let batcher = SegmentationBatcher::<TestBackend>::new(device);

        let batch = batcher.batch(vec![item(0), item(255), item(51)]);

        assert_eq!(batch.images.dims(), [3, 3, 4, 6]);
        assert_eq!(batch.masks.dims(), [3, 1, 4, 6]);

        let masks = batch.masks.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert!(masks.iter().all(|&v| v == 0 || v == 1));
        assert_eq!(&masks[..4], &[0, 1, 0, 1]);
    }

    #[test]
    fn pixel_channels_land_in_separate_planes() {
        let device = Default::default();
        let batcher = SegmentationBatcher::<TestBackend>::new(device);
        let mut sample = item(0);
        for pixel in sample.image.chunks_exact_mut(3) {
            pixel.copy_from_slice(&[0.1, 0.5, 0.9]);
        }

        let batch = batcher.batch(vec![sample]);
        let red = batch.images.clone().slice([0..1, 0..1]).mean().into_scalar();
        let blue = batch.images.slice([0..1, 2..3]).mean().into_scalar();

        assert!((red - 0.1).abs() < 1e-6);
        assert!((blue - 0.9).abs() < 1e-6);
    }

    #[test]
    fn steps_floor_the_train_size() {
        assert_eq!(steps_per_epoch(0, 16), 0);
        assert_eq!(steps_per_epoch(8, 16), 1);
        assert_eq!(steps_per_epoch(32, 16), 2);
        assert_eq!(steps_per_epoch(47, 16), 2);
    }

    #[test]
    fn repeating_loader_restarts_passes() {
        let device = Default::default();
        let config = DataConfig::new().with_batch_size(2).with_num_workers(1);
        let loader = train_loader::<TestBackend>(vec![item(1), item(2), item(3)], &config, device);

        let mut batches = RepeatingLoader::new(loader.as_ref());
        let sizes: Vec<usize> = batches.by_ref().take(5).map(|b| b.images.dims()[0]).collect();

        assert_eq!(sizes, vec![2, 1, 2, 1, 2]);
        assert_eq!(batches.passes(), 3);
    }

    #[test]
    fn test_loader_is_finite_and_ordered() {
        let device = Default::default();
        let config = DataConfig::new().with_batch_size(2);
        let loader = test_loader::<TestBackend>(vec![item(0), item(255), item(0)], &config, device);

        let batches: Vec<_> = loader.iter().collect();

        assert_eq!(batches.len(), 2);
        let first = batches[0].images.clone().slice([1..2]).mean().into_scalar();
        assert!((first - 1.0).abs() < 1e-6);
    }
}
