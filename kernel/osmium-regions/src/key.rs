//! Range keys ordered by overlap.

use core::cmp::Ordering;
use core::fmt;
use osmium_addresses::VirtualAddress;

/// A half-open span of virtual address space, `[address, address + size)`.
///
/// Keys are compared by overlap rather than by a single point: two keys are
/// [`Ordering::Equal`] when they share at least one address. Over disjoint
/// spans this is a total order, which is exactly the shape a binary search
/// tree needs, and it makes a point lookup and a collision probe the same
/// operation.
///
/// The exclusive end is computed in 128 bits so that a span reaching the top
/// of the canonical address space does not wrap to zero and compare below
/// everything else.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RangeKey {
    address: VirtualAddress,
    size: u64,
}

impl RangeKey {
    /// Creates a key covering `size` bytes starting at `address`.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `size` is zero. An empty span overlaps
    /// nothing and would silently vanish between its neighbors.
    #[must_use]
    pub const fn new(address: VirtualAddress, size: u64) -> Self {
        debug_assert!(size != 0, "a range key must cover at least one byte");
        Self { address, size }
    }

    /// A single-byte key for locating the span that contains `address`.
    #[must_use]
    pub const fn probe(address: VirtualAddress) -> Self {
        Self::new(address, 1)
    }

    /// The first address covered by the key.
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// The number of bytes covered by the key.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// The exclusive end, widened so top-of-space spans stay ordered.
    const fn end(&self) -> u128 {
        widen(self.address.as_u64()) + widen(self.size)
    }

    /// Whether `address` falls inside the span.
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.as_u64() >= self.address.as_u64() && widen(address.as_u64()) < self.end()
    }

    /// Orders two keys by position, with any shared address comparing equal.
    #[must_use]
    pub const fn overlap_cmp(&self, other: &Self) -> Ordering {
        if self.end() <= widen(other.address.as_u64()) {
            Ordering::Less
        } else if widen(self.address.as_u64()) >= other.end() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Whether the two keys share at least one address.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        matches!(self.overlap_cmp(other), Ordering::Equal)
    }
}

// `u128::from` is not const-callable yet.
#[allow(clippy::cast_lossless)]
const fn widen(value: u64) -> u128 {
    value as u128
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.address, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(base: u64, size: u64) -> RangeKey {
        RangeKey::new(VirtualAddress::new(base), size)
    }

    #[test]
    fn disjoint_keys_order_by_address() {
        assert_eq!(key(0x1000, 0x1000).overlap_cmp(&key(0x2000, 0x1000)), Ordering::Less);
        assert_eq!(key(0x2000, 0x1000).overlap_cmp(&key(0x1000, 0x1000)), Ordering::Greater);
    }

    #[test]
    fn touching_keys_do_not_overlap() {
        // Half-open spans: [0x1000, 0x2000) and [0x2000, 0x3000) are disjoint.
        assert!(!key(0x1000, 0x1000).overlaps(&key(0x2000, 0x1000)));
    }

    #[test]
    fn any_shared_address_compares_equal() {
        let base = key(0x1000, 0x1000);
        assert!(base.overlaps(&key(0x1800, 0x1000)));
        assert!(base.overlaps(&key(0x0800, 0x1000)));
        assert!(base.overlaps(&key(0x0800, 0x10000)));
        assert!(base.overlaps(&RangeKey::probe(VirtualAddress::new(0x1FFF))));
    }

    #[test]
    fn spans_reaching_the_top_of_the_address_space_stay_ordered() {
        // The temporary-mapping window ends exactly at 2^64; a 64-bit end
        // would wrap to zero and compare below everything.
        let top = key(0u64.wrapping_sub(0x20_0000), 0x20_0000);
        assert_eq!(key(0x1000, 0x1000).overlap_cmp(&top), Ordering::Less);
        assert_eq!(top.overlap_cmp(&key(0x1000, 0x1000)), Ordering::Greater);
        assert!(top.contains(VirtualAddress::new(u64::MAX)));
    }

    #[test]
    fn contains_matches_the_half_open_bounds() {
        let key = key(0x1000, 0x1000);
        assert!(!key.contains(VirtualAddress::new(0x0FFF)));
        assert!(key.contains(VirtualAddress::new(0x1000)));
        assert!(key.contains(VirtualAddress::new(0x1FFF)));
        assert!(!key.contains(VirtualAddress::new(0x2000)));
    }

    #[test]
    #[should_panic(expected = "at least one byte")]
    fn empty_keys_are_rejected() {
        let _ = key(0x1000, 0);
    }
}
