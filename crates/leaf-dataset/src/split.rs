//! Fallback train/validation partition used when no `val/` directory exists.

use rand::seq::SliceRandom;
use rand::Rng;

/// Partitions `0..len` into disjoint train and validation index sets.
///
/// `train_len = floor((1 - validation_fraction) * len)` and the validation set
/// receives the remainder. The split is not stratified: indices are shuffled
/// with `rng` and then cut once.
pub fn split_indices<R: Rng + ?Sized>(
    len: usize,
    validation_fraction: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let train_len = train_len(len, validation_fraction);

    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    let val = indices.split_off(train_len);

    (indices, val)
}

fn train_len(len: usize, validation_fraction: f64) -> usize {
    let fraction = (1.0 - validation_fraction).clamp(0.0, 1.0);
    // 1e-9 absorbs float error such as (1.0 - 0.2) * 10 = 7.999...
    ((fraction * len as f64 + 1e-9).floor() as usize).min(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn test_four_hundred_samples() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (train, val) = split_indices(400, 0.2, &mut rng);

        assert_eq!(train.len(), 320);
        assert_eq!(val.len(), 80);

        let train_set: HashSet<_> = train.iter().copied().collect();
        let val_set: HashSet<_> = val.iter().copied().collect();
        assert!(train_set.is_disjoint(&val_set));
        assert_eq!(train_set.len() + val_set.len(), 400);
    }

    #[test]
    fn test_twenty_samples() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let (train, val) = split_indices(20, 0.2, &mut rng);
        assert_eq!(train.len(), 16);
        assert_eq!(val.len(), 4);
    }

    #[test]
    fn test_floor_goes_to_train() {
        assert_eq!(train_len(10, 0.2), 8);
        assert_eq!(train_len(7, 0.2), 5);
        assert_eq!(train_len(1, 0.2), 0);
        assert_eq!(train_len(0, 0.2), 0);
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = split_indices(50, 0.2, &mut ChaCha8Rng::seed_from_u64(3));
        let b = split_indices(50, 0.2, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
