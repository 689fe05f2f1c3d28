// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Used when no separate validation file is given: whole episodes
// are shuffled and split, so turns of one conversation never end
// up on both sides.

use rand::{seq::SliceRandom, Rng};

/// Shuffle `items` with `rng` and split into (train, validation).
/// `train_fraction` is clamped to [0, 1].
pub fn split_train_val<T, R: Rng>(
    mut items: Vec<T>,
    train_fraction: f64,
    rng: &mut R,
) -> (Vec<T>, Vec<T>) {
    items.shuffle(rng);

    let total = items.len();
    let split_at = ((total as f64) * train_fraction.clamp(0.0, 1.0)).round() as usize;
    let val = items.split_off(split_at.min(total));

    tracing::debug!(
        "Episode split: {} training, {} validation",
        items.len(),
        val.len()
    );

    (items, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_correct_split_sizes() {
        let items: Vec<usize> = (0..100).collect();
        let (train, val) = split_train_val(items, 0.8, &mut StdRng::seed_from_u64(1));
        assert_eq!(train.len(), 80);
        assert_eq!(val.len(), 20);
    }

    #[test]
    fn test_all_items_preserved() {
        let items: Vec<usize> = (0..50).collect();
        let (mut train, val) = split_train_val(items, 0.7, &mut StdRng::seed_from_u64(2));
        train.extend(val);
        train.sort();
        assert_eq!(train, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let (train, val) = split_train_val(Vec::<usize>::new(), 0.8, &mut StdRng::seed_from_u64(3));
        assert!(train.is_empty());
        assert!(val.is_empty());
    }

    #[test]
    fn test_fraction_is_clamped() {
        let items: Vec<usize> = (0..10).collect();
        let (train, val) = split_train_val(items, 1.5, &mut StdRng::seed_from_u64(4));
        assert_eq!(train.len(), 10);
        assert!(val.is_empty());
    }
}
