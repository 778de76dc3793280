use std::collections::BTreeMap;

use crate::accounting::bitmap::SpaceBitmap;
use crate::address::ObjectRef;

/// Free gaps of a space, keyed by size, for packing objects into the holes
/// between survivors.
///
/// Lookups take the smallest gap that fits and put the remainder back, so
/// big gaps stay available for big objects.
#[derive(Debug, Default)]
pub struct BinPacker {
    bins: BTreeMap<usize, Vec<usize>>,
    initial_bytes: usize,
    packed_bytes: usize,
}

impl BinPacker {
    /// An empty packer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds bins from the gaps between consecutive live objects in
    /// `[begin, end)`, plus the gap from the last object to `end`.
    /// `size_of` returns an object's allocation size.
    pub fn build(
        live: &SpaceBitmap,
        begin: usize,
        end: usize,
        mut size_of: impl FnMut(ObjectRef) -> usize,
    ) -> Self {
        let mut packer = Self::new();
        let mut prev = begin;
        live.visit_marked_range(begin, end, |obj| {
            packer.add_bin(obj.addr() - prev, prev);
            prev = obj.addr() + size_of(obj);
        });
        if end > prev {
            packer.add_bin(end - prev, prev);
        }
        packer
    }

    /// Adds a free gap. Empty gaps are ignored.
    pub fn add_bin(&mut self, size: usize, addr: usize) {
        if size == 0 {
            return;
        }
        self.bins.entry(size).or_default().push(addr);
        self.initial_bytes += size;
    }

    fn insert_remainder(&mut self, size: usize, addr: usize) {
        if size != 0 {
            self.bins.entry(size).or_default().push(addr);
        }
    }

    /// Places `size` bytes in the smallest bin that fits. Returns the
    /// address, or `None` if no bin is large enough.
    pub fn take(&mut self, size: usize) -> Option<usize> {
        let (&bin_size, addrs) = self.bins.range_mut(size..).next()?;
        let addr = addrs.pop()?;
        if addrs.is_empty() {
            self.bins.remove(&bin_size);
        }
        self.insert_remainder(bin_size - size, addr + size);
        self.packed_bytes += size;
        Some(addr)
    }

    /// Bytes in the bins when they were built.
    #[must_use]
    pub const fn initial_bytes(&self) -> usize {
        self.initial_bytes
    }

    /// Bytes placed so far.
    #[must_use]
    pub const fn packed_bytes(&self) -> usize {
        self.packed_bytes
    }

    /// Bytes still free in the bins.
    #[must_use]
    pub fn remaining_bytes(&self) -> usize {
        self.bins.iter().map(|(size, addrs)| size * addrs.len()).sum()
    }

    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.values().map(Vec::len).sum()
    }

    /// Returns `true` if no gap is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Free gaps as `(addr, size)` in address order.
    #[must_use]
    pub fn gaps(&self) -> Vec<(usize, usize)> {
        let mut gaps: Vec<_> = self
            .bins
            .iter()
            .flat_map(|(&size, addrs)| addrs.iter().map(move |&a| (a, size)))
            .collect();
        gaps.sort_unstable();
        gaps
    }
}
