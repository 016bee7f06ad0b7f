use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::SegmentationItem;

/// Mirror an item left-right. Image and mask always move together.
pub fn flip_horizontal(item: &mut SegmentationItem) {
    let [_, width] = item.size;

    mirror_rows(&mut item.image, width, 3);
    mirror_rows(&mut item.mask, width, 1);
}

fn mirror_rows<T>(data: &mut [T], width: usize, channels: usize) {
    if width == 0 {
        return;
    }

    for row in data.chunks_exact_mut(width * channels) {
        for x in 0..width / 2 {
            let left = x * channels;
            let right = (width - 1 - x) * channels;
            for c in 0..channels {
                row.swap(left + c, right + c);
            }
        }
    }
}

/// Random horizontal flip with one decision per sample, shared by the image
/// and its mask.
///
/// The decision for the n-th appearance of a sample is drawn from a generator
/// seeded with `(seed, name, n)`, so it does not depend on which loader
/// worker handles the sample or in which order.
#[derive(Clone, Debug)]
pub struct HorizontalFlip {
    probability: f64,
    seed: u64,
    seen: Arc<Mutex<HashMap<String, u64>>>,
}

impl HorizontalFlip {
    pub fn new(probability: f64, seed: u64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            seed,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn apply(&self, mut item: SegmentationItem) -> SegmentationItem {
        if self.should_flip(&item.name) {
            flip_horizontal(&mut item);
        }

        item
    }

    fn should_flip(&self, name: &str) -> bool {
        let occurrence = {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            let count = seen.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };

        let mut hasher = DefaultHasher::new();
        (self.seed, name, occurrence).hash(&mut hasher);

        StdRng::seed_from_u64(hasher.finish()).random_bool(self.probability)
    }
}
