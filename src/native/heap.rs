//! # Machine Heap
//!
//! Non-moving heap behind the machine's argument records, result slots and
//! tensor buffers. Allocation is first fit over the gaps left by reclaimed
//! blocks and grows the region only when no gap fits.
//!
//! The heap does not know which blocks are reachable. The machine marks
//! them from its frame roots and hands the set to [`Heap::sweep`], which
//! frees everything else and shrinks the region to its last live block.

use crate::compiler::layout::align_up;
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::abi::{AbiMemory, ScratchMemory};
use std::collections::{BTreeMap, BTreeSet};

/// Growable heap with explicit sweeping
#[derive(Debug, Clone)]
pub struct Heap {
    region: ScratchMemory,
    limit: usize,
    /// Live blocks, start address to size
    blocks: BTreeMap<u64, usize>,
    /// Reusable gaps below the region top, start address to size
    free: BTreeMap<u64, usize>,
    since_sweep: usize,
    threshold: usize,
}

impl Heap {
    /// Heap at `base` holding at most `limit` bytes; a sweep is suggested
    /// after every quarter of the limit allocated
    pub fn new(base: u64, limit: usize) -> Self {
        Self {
            region: ScratchMemory::new(base, limit),
            limit,
            blocks: BTreeMap::new(),
            free: BTreeMap::new(),
            since_sweep: 0,
            threshold: (limit / 4).max(1),
        }
    }

    /// Bytes held by live blocks
    pub fn used(&self) -> usize {
        self.blocks.values().sum()
    }

    /// Bytes spanned by the region, gaps included
    pub fn footprint(&self) -> usize {
        self.region.used()
    }

    /// Number of live blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// True once enough has been allocated since the last sweep
    pub fn wants_sweep(&self) -> bool {
        self.since_sweep >= self.threshold
    }

    /// Start of the live block containing `addr`
    pub fn block_containing(&self, addr: u64) -> Option<u64> {
        let (&start, &size) = self.blocks.range(..=addr).next_back()?;
        (addr - start < size as u64).then_some(start)
    }

    /// Free every block whose start is not in `live`; returns the bytes
    /// reclaimed
    pub fn sweep(&mut self, live: &BTreeSet<u64>) -> usize {
        let before = self.used();
        self.blocks.retain(|start, _| live.contains(start));
        self.free.clear();
        let mut cursor = self.region.base();
        for (&start, &size) in &self.blocks {
            if start > cursor {
                self.free.insert(cursor, (start - cursor) as usize);
            }
            cursor = start + size as u64;
        }
        self.region.release(cursor);
        self.since_sweep = 0;
        before - self.used()
    }

    fn exhausted(&self, size: usize) -> RuntimeError {
        RuntimeError::new(
            RuntimeErrorKind::OutOfMemory,
            format!(
                "native heap exhausted: {} bytes requested, {} of {} bytes live",
                size,
                self.used(),
                self.limit
            ),
        )
    }

    fn take_gap(&mut self, size: usize, align: usize) -> Option<u64> {
        let (start, len, at) = self.free.iter().find_map(|(&start, &len)| {
            let at = align_up(start as usize, align) as u64;
            let pad = (at - start) as usize;
            (pad.checked_add(size)? <= len).then_some((start, len, at))
        })?;
        self.free.remove(&start);
        if at > start {
            self.free.insert(start, (at - start) as usize);
        }
        let end = at + size as u64;
        let tail = len - (end - start) as usize;
        if tail > 0 {
            self.free.insert(end, tail);
        }
        Some(at)
    }
}

impl AbiMemory for Heap {
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<(), RuntimeError> {
        self.region.load(addr, out)
    }

    fn store(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.region.store(addr, bytes)
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<u64, RuntimeError> {
        let (size, align) = (size.max(1), align.max(1));
        let addr = match self.take_gap(size, align) {
            Some(at) => {
                self.region.store(at, &vec![0u8; size])?;
                at
            }
            None => {
                let top = self.region.base() + self.region.used() as u64;
                let at = self.region.alloc(size, align).map_err(|_| self.exhausted(size))?;
                if at > top {
                    self.free.insert(top, (at - top) as usize);
                }
                at
            }
        };
        self.blocks.insert(addr, size);
        self.since_sweep = self.since_sweep.saturating_add(size);
        Ok(addr)
    }
}
