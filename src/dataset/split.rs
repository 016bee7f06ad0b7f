use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{DatasetError, SegmentationItem};

/// Disjoint train and test subsets.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit<T = SegmentationItem> {
    pub train: Vec<T>,
    pub test: Vec<T>,
}

/// Shuffle `0..len` with `seed` and cut off `ceil(len * test_fraction)`
/// indices for the test subset. Returns `(train, test)`.
pub fn split_indices(
    len: usize,
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), DatasetError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DatasetError::InvalidSplit(test_fraction));
    }

    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let num_test = ((len as f64) * test_fraction).ceil() as usize;
    let train = indices.split_off(num_test.min(len));

    Ok((train, indices))
}

/// Deterministic train/test partition: the same seed and input order always
/// give the same subsets.
pub fn train_test_split<T>(
    items: Vec<T>,
    test_fraction: f64,
    seed: u64,
) -> Result<DatasetSplit<T>, DatasetError> {
    let (train_indices, test_indices) = split_indices(items.len(), test_fraction, seed)?;

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut take = |indices: Vec<usize>| -> Vec<T> {
        indices
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect()
    };

    let train = take(train_indices);
    let test = take(test_indices);

    tracing::debug!("Split {} train / {} test samples", train.len(), test.len());

    Ok(DatasetSplit { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ten_samples_give_eight_train_two_test() {
        let split = train_test_split((0..10).collect(), 0.2, 42).unwrap();

        assert_eq!(split.train.len(), 8);
        assert_eq!(split.test.len(), 2);
    }

    #[test]
    fn split_is_deterministic() {
        let first = train_test_split((0..57).collect::<Vec<u32>>(), 0.2, 42).unwrap();
        let second = train_test_split((0..57).collect::<Vec<u32>>(), 0.2, 42).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.test.len(), 12);
        assert_eq!(first.train.len(), 45);
    }

    #[test]
    fn subsets_are_disjoint_and_complete() {
        let split = train_test_split((0..100).collect::<Vec<u32>>(), 0.2, 7).unwrap();

        let train: HashSet<_> = split.train.iter().copied().collect();
        let test: HashSet<_> = split.test.iter().copied().collect();

        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 100);
    }

    #[test]
    fn different_seeds_shuffle_differently() {
        let (_, a) = split_indices(100, 0.2, 1).unwrap();
        let (_, b) = split_indices(100, 0.2, 2).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn rejects_fractions_outside_unit_interval() {
        for fraction in [0.0, 1.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                split_indices(10, fraction, 42),
                Err(DatasetError::InvalidSplit(_))
            ));
        }
    }
}
