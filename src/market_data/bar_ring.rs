// =============================================================================
// Bar Ring — bounded history of bars for one subscriber
// =============================================================================

use std::collections::VecDeque;

use crate::market_data::bar::Bar;

/// Default number of bars retained per subscriber.
pub const DEFAULT_BAR_CAPACITY: usize = 5_000;

/// Ring of bars, oldest at the front. The newest bar is the active (open)
/// bucket and is mutated in place; everything behind it is finalized. When
/// full, pushing a new bar evicts the oldest.
#[derive(Debug, Clone)]
pub struct BarRing {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Open a new bucket. The previous newest bar becomes finalized.
    pub fn push(&mut self, bar: Bar) {
        while self.bars.len() >= self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    /// The bar currently being built.
    pub fn active(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn active_mut(&mut self) -> Option<&mut Bar> {
        self.bars.back_mut()
    }

    /// The most recent bar that will no longer change.
    pub fn last_finalized(&self) -> Option<&Bar> {
        let len = self.bars.len();
        if len < 2 {
            return None;
        }
        self.bars.get(len - 2)
    }

    /// All bars, oldest first.
    pub fn to_vec(&self) -> Vec<Bar> {
        self.bars.iter().cloned().collect()
    }

    /// Bars in `[start, end)`, clamped to what is stored.
    pub fn range(&self, start: usize, end: usize) -> Vec<Bar> {
        let end = end.min(self.bars.len());
        let start = start.min(end);
        self.bars.range(start..end).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BarRing {
    fn default() -> Self {
        Self::new(DEFAULT_BAR_CAPACITY)
    }
}
