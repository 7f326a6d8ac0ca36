//! Handle id encoding.
//!
//! Ids are 64-bit with the two low bits reserved for flags. Bit 0 (MANAGED)
//! is set on every id this bus allocates. Bit 1 (ALLOCATE) is only meaningful
//! on ids passed *into* a send: it asks for a fresh node instead of naming an
//! existing handle. The remaining bits are a per-peer counter shifted left by
//! two, so ids are strictly increasing per peer and never reused.

/// A handle id as seen across the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Set on every id allocated by the bus.
    pub const MANAGED: u64 = 1 << 0;

    /// Requests allocation of a new node when passed into a send.
    pub const ALLOCATE: u64 = 1 << 1;

    /// Sentinel distinct from every valid id.
    pub const INVALID: Self = Self(u64::MAX);

    /// Wrap a raw id value.
    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw id value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_managed(self) -> bool {
        self.0 & Self::MANAGED != 0
    }

    /// True for the exact pattern that requests a fresh node: ALLOCATE plus
    /// MANAGED and nothing else. Any other use of the ALLOCATE bit is
    /// rejected by the transfer import.
    #[inline]
    pub const fn is_allocate_request(self) -> bool {
        self.0 == (Self::ALLOCATE | Self::MANAGED)
    }

    #[inline]
    pub const fn has_allocate_flag(self) -> bool {
        !self.is_invalid() && self.0 & Self::ALLOCATE != 0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "<invalid>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Per-peer id allocator. Lives under the peer lock.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    /// Allocate the next id: strictly increasing, never recycled.
    pub(crate) fn allocate(&mut self) -> HandleId {
        self.last += 1;
        HandleId::from_raw((self.last << 2) | HandleId::MANAGED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_managed_and_increasing() {
        let mut alloc = IdAllocator::default();
        let a = alloc.allocate();
        let b = alloc.allocate();
        let c = alloc.allocate();
        assert_eq!(a.get(), 5);
        assert_eq!(b.get(), 9);
        assert_eq!(c.get(), 13);
        assert!(a.is_managed() && b.is_managed() && c.is_managed());
        assert!(a < b && b < c);
    }

    #[test]
    fn allocate_request_pattern_is_exact() {
        assert!(HandleId::from_raw(0b11).is_allocate_request());
        assert!(!HandleId::from_raw(0b10).is_allocate_request());
        assert!(!HandleId::from_raw(0b111).is_allocate_request());
        assert!(!HandleId::INVALID.is_allocate_request());
    }

    #[test]
    fn invalid_is_distinct() {
        let mut alloc = IdAllocator::default();
        for _ in 0..64 {
            assert_ne!(alloc.allocate(), HandleId::INVALID);
        }
        assert!(HandleId::INVALID.is_invalid());
    }
}
