//! Per-tier free-stack heads and page counters.
//!
//! The stacks themselves have no storage of their own: the links live inside
//! the page records, so a stack is nothing but a head index per tier. This
//! type only keeps the heads and the bookkeeping counters; the record updates
//! that thread the list are the
//! [`FrameAllocator`](crate::FrameAllocator)'s job.

use osmium_addresses::Tier;

/// Head index marking an empty stack.
pub const EMPTY: i32 = -1;

/// Free-stack heads and page counters, one slot per [`Tier`].
pub struct FrameStacks {
    first_free: [i32; 3],
    free_count: [u64; 3],
    total_count: [u64; 3],
}

impl FrameStacks {
    /// All stacks empty, all counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first_free: [EMPTY; 3],
            free_count: [0; 3],
            total_count: [0; 3],
        }
    }

    /// Head page index of the tier's free stack, [`EMPTY`] when the stack
    /// has no pages.
    #[must_use]
    pub const fn head(&self, tier: Tier) -> i32 {
        self.first_free[tier.index()]
    }

    /// Replaces the head page index of the tier's free stack.
    pub const fn set_head(&mut self, tier: Tier, index: i32) {
        self.first_free[tier.index()] = index;
    }

    /// Number of pages currently on the tier's free stack.
    #[must_use]
    pub const fn free_pages(&self, tier: Tier) -> u64 {
        self.free_count[tier.index()]
    }

    /// Number of present pages in the tier, free or allocated.
    #[must_use]
    pub const fn total_pages(&self, tier: Tier) -> u64 {
        self.total_count[tier.index()]
    }

    /// Accounts for a page joining the tier's free stack.
    pub const fn count_push(&mut self, tier: Tier) {
        self.free_count[tier.index()] += 1;
    }

    /// Accounts for a page leaving the tier's free stack.
    pub const fn count_pop(&mut self, tier: Tier) {
        self.free_count[tier.index()] -= 1;
    }

    /// Accounts for a page becoming present in the tier.
    pub const fn count_present(&mut self, tier: Tier) {
        self.total_count[tier.index()] += 1;
    }
}

impl Default for FrameStacks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_start_empty() {
        let stacks = FrameStacks::new();
        for tier in [Tier::Low, Tier::Conventional, Tier::High] {
            assert_eq!(stacks.head(tier), EMPTY);
            assert_eq!(stacks.free_pages(tier), 0);
            assert_eq!(stacks.total_pages(tier), 0);
        }
    }

    #[test]
    fn counters_track_their_tier_only() {
        let mut stacks = FrameStacks::new();
        stacks.set_head(Tier::High, 7);
        stacks.count_push(Tier::High);
        stacks.count_present(Tier::High);

        assert_eq!(stacks.head(Tier::High), 7);
        assert_eq!(stacks.free_pages(Tier::High), 1);
        assert_eq!(stacks.total_pages(Tier::High), 1);
        assert_eq!(stacks.head(Tier::Conventional), EMPTY);
        assert_eq!(stacks.free_pages(Tier::Conventional), 0);

        stacks.count_pop(Tier::High);
        assert_eq!(stacks.free_pages(Tier::High), 0);
        assert_eq!(stacks.total_pages(Tier::High), 1);
    }
}
