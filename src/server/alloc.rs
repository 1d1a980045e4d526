//! Server-side address space bookkeeping for one file.
//!
//! The set-aside process is the only party that hands out file addresses, so clients never
//! race each other growing the end of allocated space.

use crate::wire::{FeatureFlags, MemKind, OpenParams, Status};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub address: u64,
    pub size: u64,
    /// End of allocated space after this allocation.
    pub end_of_address: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("cannot allocate zero bytes")]
    ZeroSize,
    #[error("allocating {size} bytes would pass max address {max_address:#x}")]
    Exhausted { size: u64, max_address: u64 },
    #[error("cannot free [{address:#x}, +{size}): {reason}")]
    InvalidFree {
        address: u64,
        size: u64,
        reason: &'static str,
    },
}

impl AllocError {
    pub fn status(&self) -> Status {
        match self {
            AllocError::ZeroSize | AllocError::Exhausted { .. } => Status::CantAlloc,
            AllocError::InvalidFree { .. } => Status::CantFree,
        }
    }
}

/// Unused tail of an aggregation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    next: u64,
    end: u64,
}

impl Block {
    fn remaining(&self) -> u64 {
        self.end - self.next
    }

    fn overlaps(&self, address: u64, end: u64) -> bool {
        address < self.end && end > self.next
    }
}

#[derive(Debug, Clone, Copy)]
enum Aggregator {
    Metadata,
    SmallData,
}

#[derive(Debug)]
pub struct SpaceAllocator {
    max_address: u64,
    feature_flags: FeatureFlags,
    meta_block_size: u64,
    small_data_block_size: u64,
    threshold: u64,
    alignment: u64,
    eoa: u64,
    /// Free extents keyed by start address; never adjacent after coalescing.
    free: BTreeMap<u64, u64>,
    meta_block: Option<Block>,
    small_block: Option<Block>,
}

impl SpaceAllocator {
    /// Starts tracking a file whose allocated space currently ends at `eoa`.
    ///
    /// A zero `max_address` means unlimited and a zero `alignment` means unaligned.
    pub fn new(params: &OpenParams, eoa: u64) -> Self {
        Self {
            max_address: if params.max_address == 0 {
                u64::MAX
            } else {
                params.max_address
            },
            feature_flags: params.feature_flags,
            meta_block_size: params.meta_block_size,
            small_data_block_size: params.small_data_block_size,
            threshold: params.threshold,
            alignment: params.alignment.max(1),
            eoa,
            free: BTreeMap::new(),
            meta_block: None,
            small_block: None,
        }
    }

    pub fn end_of_address(&self) -> u64 {
        self.eoa
    }

    /// Total bytes sitting in the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn free_extents(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free.iter().map(|(start, len)| (*start, *len))
    }

    pub fn allocate(&mut self, mem_kind: MemKind, size: u64) -> Result<Allocation, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let aggregator = if mem_kind.is_metadata() {
            (self.feature_flags.contains(FeatureFlags::AGGREGATE_METADATA)
                && size < self.meta_block_size)
                .then_some(Aggregator::Metadata)
        } else {
            (self.feature_flags.contains(FeatureFlags::AGGREGATE_SMALLDATA)
                && size < self.small_data_block_size)
                .then_some(Aggregator::SmallData)
        };
        let address = match aggregator {
            Some(aggregator) => self.from_block(aggregator, size)?,
            None => self.place(size)?,
        };
        Ok(Allocation {
            address,
            size,
            end_of_address: self.eoa,
        })
    }

    /// Returns `[address, address + size)` to the free list and reports the end of address.
    pub fn free(&mut self, address: u64, size: u64) -> Result<u64, AllocError> {
        let invalid = |reason| AllocError::InvalidFree {
            address,
            size,
            reason,
        };
        if size == 0 {
            return Err(invalid("zero size"));
        }
        let end = address
            .checked_add(size)
            .ok_or_else(|| invalid("range overflows"))?;
        if end > self.eoa {
            return Err(invalid("beyond end of allocated space"));
        }
        if let Some((start, len)) = self.free.range(..end).next_back() {
            if start + len > address {
                return Err(invalid("overlaps free space"));
            }
        }
        let in_block = [self.meta_block, self.small_block]
            .iter()
            .flatten()
            .any(|block| block.overlaps(address, end));
        if in_block {
            return Err(invalid("overlaps unallocated aggregation space"));
        }
        self.release(address, size);
        Ok(self.eoa)
    }

    fn from_block(&mut self, aggregator: Aggregator, size: u64) -> Result<u64, AllocError> {
        let block_size = match aggregator {
            Aggregator::Metadata => self.meta_block_size,
            Aggregator::SmallData => self.small_data_block_size,
        };
        let current = match aggregator {
            Aggregator::Metadata => self.meta_block,
            Aggregator::SmallData => self.small_block,
        };
        let block = match current {
            Some(block) if block.remaining() >= size => block,
            stale => {
                let start = match self.place(block_size) {
                    Ok(start) => start,
                    // Not enough room for a whole block; place the request on its own.
                    Err(_) => return self.place(size),
                };
                if let Some(old) = stale {
                    if old.remaining() > 0 {
                        self.release(old.next, old.remaining());
                    }
                }
                Block {
                    next: start,
                    end: start + block_size,
                }
            }
        };
        let address = block.next;
        let updated = Some(Block {
            next: block.next + size,
            end: block.end,
        });
        match aggregator {
            Aggregator::Metadata => self.meta_block = updated,
            Aggregator::SmallData => self.small_block = updated,
        }
        Ok(address)
    }

    /// First fit from the free list, else grow the end of address.
    fn place(&mut self, size: u64) -> Result<u64, AllocError> {
        let align = if self.alignment > 1 && size >= self.threshold {
            self.alignment
        } else {
            1
        };
        let fit = self.free.iter().find_map(|(start, len)| {
            let aligned = align_up(*start, align)?;
            let end = aligned.checked_add(size)?;
            (end <= start + len).then_some((*start, *len, aligned))
        });
        if let Some((start, len, aligned)) = fit {
            self.free.remove(&start);
            if aligned > start {
                self.free.insert(start, aligned - start);
            }
            let tail = aligned + size;
            if tail < start + len {
                self.free.insert(tail, start + len - tail);
            }
            return Ok(aligned);
        }

        let exhausted = AllocError::Exhausted {
            size,
            max_address: self.max_address,
        };
        let address = align_up(self.eoa, align).ok_or_else(|| exhausted.clone())?;
        let end = address.checked_add(size).ok_or_else(|| exhausted.clone())?;
        if end > self.max_address {
            return Err(exhausted);
        }
        if address > self.eoa {
            let gap_start = self.eoa;
            self.eoa = end;
            self.release(gap_start, address - gap_start);
        } else {
            self.eoa = end;
        }
        Ok(address)
    }

    fn release(&mut self, address: u64, size: u64) {
        let mut start = address;
        let mut len = size;
        if let Some((&prev_start, &prev_len)) = self.free.range(..address).next_back() {
            if prev_start + prev_len == address {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(address + size)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(value);
    }
    match value % align {
        0 => Some(value),
        rem => value.checked_add(align - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(flags: FeatureFlags) -> OpenParams {
        OpenParams {
            max_address: 1 << 20,
            feature_flags: flags,
            meta_block_size: 256,
            small_data_block_size: 256,
            threshold: 1,
            alignment: 1,
        }
    }

    #[test]
    fn zero_max_address_never_exhausts() {
        let unbounded = OpenParams {
            max_address: 0,
            ..params(FeatureFlags::empty())
        };
        let mut alloc = SpaceAllocator::new(&unbounded, 0);
        let huge = alloc.allocate(MemKind::Draw, 1 << 40).unwrap();
        assert_eq!(huge.address, 0);
        assert_eq!(alloc.end_of_address(), 1 << 40);
    }

    #[test]
    fn plain_allocations_grow_end_of_address() {
        let mut alloc = SpaceAllocator::new(&params(FeatureFlags::empty()), 96);
        let a = alloc.allocate(MemKind::Ohdr, 40).unwrap();
        let b = alloc.allocate(MemKind::Draw, 10).unwrap();
        assert_eq!((a.address, a.end_of_address), (96, 136));
        assert_eq!((b.address, b.end_of_address), (136, 146));
    }

    #[test]
    fn freed_space_is_reused_first_fit_and_coalesced() {
        let mut alloc = SpaceAllocator::new(&params(FeatureFlags::empty()), 0);
        let a = alloc.allocate(MemKind::Ohdr, 100).unwrap();
        let b = alloc.allocate(MemKind::Ohdr, 100).unwrap();
        let _c = alloc.allocate(MemKind::Ohdr, 100).unwrap();
        assert_eq!(alloc.free(a.address, 100).unwrap(), 300);
        assert_eq!(alloc.free(b.address, 100).unwrap(), 300);
        assert_eq!(alloc.free_extents().collect::<Vec<_>>(), vec![(0, 200)]);

        let d = alloc.allocate(MemKind::Ohdr, 150).unwrap();
        assert_eq!(d.address, 0);
        assert_eq!(d.end_of_address, 300);
        assert_eq!(alloc.free_extents().collect::<Vec<_>>(), vec![(150, 50)]);
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let mut alloc = SpaceAllocator::new(&params(FeatureFlags::empty()), 0);
        alloc.allocate(MemKind::Ohdr, 64).unwrap();
        alloc.free(0, 32).unwrap();
        for (address, size) in [(0, 0), (40, 64), (16, 8)] {
            let err = alloc.free(address, size).unwrap_err();
            assert_eq!(err.status(), Status::CantFree);
        }
    }

    #[test]
    fn max_address_bounds_growth() {
        let mut p = params(FeatureFlags::empty());
        p.max_address = 100;
        let mut alloc = SpaceAllocator::new(&p, 0);
        alloc.allocate(MemKind::Ohdr, 90).unwrap();
        let err = alloc.allocate(MemKind::Ohdr, 20).unwrap_err();
        assert_eq!(err.status(), Status::CantAlloc);
        assert_eq!(alloc.end_of_address(), 90);
        assert_eq!(
            alloc.allocate(MemKind::Ohdr, 0).unwrap_err(),
            AllocError::ZeroSize
        );
    }

    #[test]
    fn large_requests_are_aligned_and_gaps_kept_free() {
        let mut p = params(FeatureFlags::empty());
        p.threshold = 64;
        p.alignment = 128;
        let mut alloc = SpaceAllocator::new(&p, 10);
        let small = alloc.allocate(MemKind::Ohdr, 8).unwrap();
        assert_eq!(small.address, 10);
        let big = alloc.allocate(MemKind::Draw, 64).unwrap();
        assert_eq!(big.address, 128);
        assert_eq!(big.end_of_address, 192);
        assert_eq!(alloc.free_extents().collect::<Vec<_>>(), vec![(18, 110)]);
    }

    #[test]
    fn small_metadata_is_carved_from_aggregation_blocks() {
        let flags = FeatureFlags::AGGREGATE_METADATA.union(FeatureFlags::AGGREGATE_SMALLDATA);
        let mut alloc = SpaceAllocator::new(&params(flags), 0);
        let a = alloc.allocate(MemKind::Ohdr, 100).unwrap();
        let b = alloc.allocate(MemKind::Btree, 100).unwrap();
        assert_eq!((a.address, b.address), (0, 100));
        assert_eq!(b.end_of_address, 256);

        let raw = alloc.allocate(MemKind::Draw, 10).unwrap();
        assert_eq!(raw.address, 256);
        assert_eq!(raw.end_of_address, 512);

        // Does not fit the remaining 56 bytes: a fresh block, old tail freed.
        let c = alloc.allocate(MemKind::Ohdr, 100).unwrap();
        assert_eq!(c.address, 512);
        assert_eq!(alloc.free_extents().collect::<Vec<_>>(), vec![(200, 56)]);
        assert!(alloc.free(700, 8).is_err());

        let big = alloc.allocate(MemKind::Ohdr, 300).unwrap();
        assert_eq!(big.address, 768);
    }

    #[test]
    fn end_of_address_is_monotonic() {
        let mut alloc = SpaceAllocator::new(&params(FeatureFlags::empty()), 0);
        let mut last = 0;
        for size in [10u64, 20, 30] {
            let allocation = alloc.allocate(MemKind::Gheap, size).unwrap();
            assert!(allocation.end_of_address >= last);
            last = allocation.end_of_address;
        }
        let eoa = alloc.free(30, 30).unwrap();
        assert_eq!(eoa, last);
    }
}
