//! Batching over a `RewardDataset`

use crate::collator::{Collator, RewardBatch};
use crate::data::{RewardDataset, RewardExample};
use crate::error::Result;
use rand::{seq::SliceRandom, thread_rng, Rng};

/// Yields collated batches over a dataset, analogous to PyTorch's `DataLoader`
pub struct RewardDataLoader<C: Collator> {
    dataset: RewardDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    collator: C,
}

impl<C: Collator> RewardDataLoader<C> {
    pub fn new(
        dataset: RewardDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        collator: C,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            collator,
        }
    }

    /// Returns a batcher, shuffling with the thread rng if enabled.
    pub fn batcher(&self) -> RewardBatcher<'_, C> {
        self.batcher_with_rng(&mut thread_rng())
    }

    /// Returns a batcher, shuffling with `rng` if enabled.
    pub fn batcher_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> RewardBatcher<'_, C> {
        let mut remaining_indices = (0..self.dataset.len()).rev().collect::<Vec<_>>();
        if self.shuffle {
            remaining_indices.shuffle(rng);
        }
        RewardBatcher {
            dataset: self.dataset.clone(),
            remaining_indices,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            collator: &self.collator,
        }
    }

    /// Number of batches per pass over the dataset.
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset(&self) -> &RewardDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

pub struct RewardBatcher<'a, C: Collator> {
    dataset: RewardDataset,
    remaining_indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    collator: &'a C,
}

impl<C: Collator> Iterator for RewardBatcher<'_, C> {
    type Item = Result<RewardBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let available = self.remaining_indices.len();
        if available == 0 || (self.drop_last && available < self.batch_size) {
            return None;
        }
        let take = std::cmp::min(self.batch_size, available);
        let examples = (0..take)
            .filter_map(|_| self.remaining_indices.pop())
            .filter_map(|idx| self.dataset.get_item_at_index(idx).cloned())
            .collect::<Vec<RewardExample>>();
        Some(self.collator.collate(&examples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::{RewardDataCollatorWithPadding, ZeroPadRewardCollator};
    use anyhow::Result;
    use rand::{rngs::StdRng, SeedableRng};
    use rstest::*;

    #[fixture]
    fn dataset() -> RewardDataset {
        let examples = (1..=5_u32)
            .map(|i| RewardExample::from_ids((0..i).collect(), vec![i]))
            .collect::<Vec<_>>();
        RewardDataset::from_examples(examples)
    }

    fn collator() -> ZeroPadRewardCollator {
        ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(99_u32))
    }

    #[rstest]
    #[case(2, false, 3)]
    #[case(2, true, 2)]
    #[case(5, true, 1)]
    #[case(6, true, 0)]
    fn test_loader_len(
        dataset: RewardDataset,
        #[case] batch_size: usize,
        #[case] drop_last: bool,
        #[case] expected: usize,
    ) -> Result<()> {
        let loader = RewardDataLoader::new(dataset, batch_size, false, drop_last, collator());
        assert_eq!(loader.len(), expected);

        let mut count = 0_usize;
        for batch in loader.batcher() {
            let batch = batch?;
            assert!(batch.batch_size() <= batch_size);
            count += 1;
        }
        assert_eq!(count, expected);
        Ok(())
    }

    #[rstest]
    fn test_loader_in_order_without_shuffle(dataset: RewardDataset) -> Result<()> {
        let loader = RewardDataLoader::new(dataset, 2, false, false, collator());
        let first = loader.batcher().next().unwrap()?;
        assert_eq!(
            first.input_ids_chosen.to_vec2::<u32>()?,
            &[[0_u32, 0], [0, 1]]
        );
        Ok(())
    }

    #[rstest]
    fn test_seeded_shuffle_is_reproducible(dataset: RewardDataset) -> Result<()> {
        let loader = RewardDataLoader::new(dataset, 5, true, false, collator());
        let a = loader
            .batcher_with_rng(&mut StdRng::seed_from_u64(7))
            .next()
            .unwrap()?;
        let b = loader
            .batcher_with_rng(&mut StdRng::seed_from_u64(7))
            .next()
            .unwrap()?;
        assert_eq!(
            a.input_ids_rejected.to_vec2::<u32>()?,
            b.input_ids_rejected.to_vec2::<u32>()?
        );
        Ok(())
    }
}
