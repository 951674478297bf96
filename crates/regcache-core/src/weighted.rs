//! Weighted random selection
//!
//! [`WeightedSelector`] picks an index from any [`WeightedList`] with
//! probability proportional to its weight, in one linear scan.
//!
//! A list states where its total weight comes from through [`TotalWeight`]:
//! plain lists let the selector sum the weights on every draw, while
//! [`PresummedList`] carries a total computed once up front.

use std::sync::Arc;

use crate::random::RandomSource;

/// A value paired with its selection weight.
///
/// Negative weights are invalid and are treated as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedItem<T> {
    pub value: T,
    pub weight: i64,
}

impl<T> WeightedItem<T> {
    pub fn new(value: T, weight: i64) -> Self {
        Self { value, weight }
    }
}

/// Where a list's total weight comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalWeight {
    /// Sum the item weights at selection time
    Computed,
    /// Total known in advance
    Supplied(u64),
}

/// Anything exposing per-item weights by index.
pub trait WeightedList {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw weight of item `index`; the selector clamps negatives to zero.
    fn weight(&self, index: usize) -> i64;

    fn item(&self, index: usize) -> &Self::Item;

    fn total_weight(&self) -> TotalWeight {
        TotalWeight::Computed
    }
}

impl<T> WeightedList for [WeightedItem<T>] {
    type Item = T;

    fn len(&self) -> usize {
        <[WeightedItem<T>]>::len(self)
    }

    fn weight(&self, index: usize) -> i64 {
        self[index].weight
    }

    fn item(&self, index: usize) -> &T {
        &self[index].value
    }
}

impl<T> WeightedList for Vec<WeightedItem<T>> {
    type Item = T;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn weight(&self, index: usize) -> i64 {
        self[index].weight
    }

    fn item(&self, index: usize) -> &T {
        &self[index].value
    }
}

/// Weighted list whose total is computed once, for lists drawn from often.
#[derive(Debug, Clone)]
pub struct PresummedList<T> {
    items: Vec<WeightedItem<T>>,
    total: u64,
}

impl<T> PresummedList<T> {
    pub fn new(items: Vec<WeightedItem<T>>) -> Self {
        let total = items
            .iter()
            .map(|item| clamp_weight(item.weight) as u64)
            .fold(0u64, u64::saturating_add);
        Self { items, total }
    }

    /// Uses a caller-supplied total. If it exceeds the real sum, draws that
    /// land past the last item select nothing.
    pub fn with_total(items: Vec<WeightedItem<T>>, total: u64) -> Self {
        Self { items, total }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn items(&self) -> &[WeightedItem<T>] {
        &self.items
    }
}

impl<T> WeightedList for PresummedList<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.items.len()
    }

    fn weight(&self, index: usize) -> i64 {
        self.items[index].weight
    }

    fn item(&self, index: usize) -> &T {
        &self.items[index].value
    }

    fn total_weight(&self) -> TotalWeight {
        TotalWeight::Supplied(self.total)
    }
}

fn clamp_weight(weight: i64) -> i64 {
    weight.max(0)
}

/// Selects items with probability `weight / total`.
#[derive(Clone)]
pub struct WeightedSelector {
    random: Arc<RandomSource>,
}

impl WeightedSelector {
    pub fn new(random: Arc<RandomSource>) -> Self {
        Self { random }
    }

    /// Returns the chosen index and item, or `None` for an empty list or a
    /// zero total.
    ///
    /// Draws `r` in `[0, total)` and returns the first `i` with
    /// `sum(w[..i]) <= r < sum(w[..=i])`. Zero-weight items are never chosen.
    pub fn select<'a, L>(&self, list: &'a L) -> Option<(usize, &'a L::Item)>
    where
        L: WeightedList + ?Sized,
    {
        let len = list.len();
        if len == 0 {
            return None;
        }

        let total = match list.total_weight() {
            TotalWeight::Computed => (0..len)
                .map(|i| clamp_weight(list.weight(i)))
                .fold(0i64, i64::saturating_add),
            TotalWeight::Supplied(total) => i64::try_from(total).unwrap_or(i64::MAX),
        };
        if total <= 0 {
            return None;
        }

        let mut remaining = self.random.between(0, total);
        for i in 0..len {
            let weight = clamp_weight(list.weight(i));
            if remaining < weight {
                return Some((i, list.item(i)));
            }
            remaining -= weight;
        }
        None
    }

    /// Like [`select`](Self::select) but returns only the index.
    pub fn select_index<L>(&self, list: &L) -> Option<usize>
    where
        L: WeightedList + ?Sized,
    {
        self.select(list).map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(seed: u64) -> WeightedSelector {
        WeightedSelector::new(Arc::new(RandomSource::seeded(seed)))
    }

    fn items(weights: &[i64]) -> Vec<WeightedItem<usize>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| WeightedItem::new(i, *w))
            .collect()
    }

    fn counts(selector: &WeightedSelector, list: &impl WeightedList, trials: usize) -> Vec<usize> {
        let mut counts = vec![0usize; list.len()];
        for _ in 0..trials {
            let index = selector.select_index(list).expect("non-empty list");
            counts[index] += 1;
        }
        counts
    }

    /// Pearson chi-square statistic against the expected weight shares.
    fn chi_square(counts: &[usize], weights: &[i64]) -> f64 {
        let trials: usize = counts.iter().sum();
        let total: i64 = weights.iter().sum();
        counts
            .iter()
            .zip(weights)
            .filter(|(_, w)| **w > 0)
            .map(|(observed, w)| {
                let expected = trials as f64 * *w as f64 / total as f64;
                let diff = *observed as f64 - expected;
                diff * diff / expected
            })
            .sum()
    }

    #[test]
    fn test_empty_list_returns_none() {
        let list: Vec<WeightedItem<u32>> = Vec::new();
        assert!(selector(1).select(&list).is_none());
        assert!(selector(1).select(&PresummedList::new(list)).is_none());
    }

    #[test]
    fn test_zero_total_returns_none() {
        let list = items(&[0, 0, 0]);
        assert!(selector(1).select(&list).is_none());
    }

    #[test]
    fn test_single_item_always_selected() {
        let list = items(&[5]);
        let s = selector(2);
        for _ in 0..100 {
            assert_eq!(s.select(&list), Some((0, &0)));
        }
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let list = items(&[3, 0, 5, 0, 2]);
        let counts = counts(&selector(5), &list, 50_000);
        assert_eq!(counts[1], 0);
        assert_eq!(counts[3], 0);
        assert!(counts[0] > 0 && counts[2] > 0 && counts[4] > 0);
    }

    #[test]
    fn test_negative_weight_treated_as_zero() {
        let list = items(&[-10, 4]);
        let counts = counts(&selector(9), &list, 10_000);
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 10_000);
    }

    #[test]
    fn test_weighted_fairness_chi_square() {
        let weights = [1, 2, 3, 4];
        let list = items(&weights);
        let counts = counts(&selector(1234), &list, 100_000);

        // df = 3, p = 0.001
        let stat = chi_square(&counts, &weights);
        assert!(stat < 16.27, "chi-square {} too large for {:?}", stat, counts);
    }

    #[test]
    fn test_presummed_matches_computed_distribution() {
        let weights = [10, 10, 10, 10, 10];
        let list = PresummedList::new(items(&weights));
        assert_eq!(list.total(), 50);
        assert_eq!(list.total_weight(), TotalWeight::Supplied(50));

        let counts = counts(&selector(77), &list, 50_000);
        // df = 4, p = 0.001
        let stat = chi_square(&counts, &weights);
        assert!(stat < 18.47, "chi-square {} too large for {:?}", stat, counts);
    }

    #[test]
    fn test_supplied_total_too_large_can_miss() {
        let list = PresummedList::with_total(items(&[1]), 1_000);
        let s = selector(3);
        let misses = (0..1_000).filter(|_| s.select(&list).is_none()).count();
        assert!(misses > 900);
    }

    #[test]
    fn test_large_list() {
        let weights: Vec<i64> = (0..5_000).map(|i| (i % 7) as i64).collect();
        let list = items(&weights);
        let s = selector(8);
        for _ in 0..1_000 {
            let (index, _) = s.select(&list).unwrap();
            assert!(weights[index] > 0);
        }
    }

    #[test]
    fn test_slice_list() {
        let list = items(&[0, 1]);
        assert_eq!(selector(4).select(&list[..]), Some((1, &1)));
    }
}
