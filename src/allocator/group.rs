//! Allocation groups
//!
//! An allocation group owns a contiguous slice of the volume and the bitmap
//! blocks describing it. Besides the bitmap itself it keeps a free block
//! count and a cached largest free run so that most "is there room here?"
//! questions are answered without touching the bitmap.

use super::bitmap::{BitmapBlock, WORD_BITS};
use super::BlockRun;
use crate::error::{AllocError, Result};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::error;

/// A maximal run of free blocks inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRun {
    pub start: u32,
    pub length: u32,
}

impl FreeRun {
    pub fn end(&self) -> u32 {
        self.start + self.length
    }

    fn overlaps(&self, start: u32, length: u32) -> bool {
        self.length > 0 && start < self.end() && self.start < start + length
    }
}

/// Cached largest free run
///
/// `Known` is always exact: the largest run, lowest start on ties. Anything
/// that could break that turns it into `Unknown`, and the next `find_run`
/// that needs it rescans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LargestRun {
    Unknown,
    Known(FreeRun),
}

#[derive(Debug, Clone)]
pub struct AllocationGroup {
    index: u32,
    num_blocks: u32,
    first_bitmap_block: u64,
    bits_per_block: u32,
    bitmaps: Vec<BitmapBlock>,
    free_blocks: u32,
    largest: LargestRun,
}

impl AllocationGroup {
    /// Record the group's geometry; the bitmap starts out all free
    ///
    /// Nothing is read from disk here. The owning allocator feeds the
    /// on-disk bitmap blocks through [`load_bitmap_block`](Self::load_bitmap_block)
    /// and then calls [`finish_load`](Self::finish_load).
    pub fn new(
        index: u32,
        num_blocks: u32,
        bitmap_block_count: u32,
        first_bitmap_block: u64,
        block_size: usize,
    ) -> Self {
        let bits_per_block = (block_size * 8) as u32;
        let bitmaps = (0..bitmap_block_count)
            .map(|i| {
                let bits = num_blocks
                    .saturating_sub(i * bits_per_block)
                    .min(bits_per_block);
                BitmapBlock::new(block_size, bits)
            })
            .collect();

        AllocationGroup {
            index,
            num_blocks,
            first_bitmap_block,
            bits_per_block,
            bitmaps,
            free_blocks: num_blocks,
            largest: LargestRun::Unknown,
        }
    }

    /// Replace the in-memory image of bitmap block `i` with on-disk contents
    pub fn load_bitmap_block(&mut self, i: usize, bytes: &[u8]) {
        let bits = self.bitmaps[i].num_bits();
        self.bitmaps[i] = BitmapBlock::from_bytes(bytes, bits);
    }

    /// Recompute counters after bitmap blocks were (re)loaded
    pub fn finish_load(&mut self) {
        let used: u32 = self.bitmaps.iter().map(BitmapBlock::count_set).sum();
        self.free_blocks = self.num_blocks - used;
        self.largest = LargestRun::Unknown;
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    pub fn used_blocks(&self) -> u32 {
        self.num_blocks - self.free_blocks
    }

    pub fn bitmap_block_count(&self) -> usize {
        self.bitmaps.len()
    }

    /// Absolute block number of the group's first bitmap block
    pub fn first_bitmap_block(&self) -> u64 {
        self.first_bitmap_block
    }

    pub fn bitmap_block(&self, i: usize) -> &BitmapBlock {
        &self.bitmaps[i]
    }

    /// Current largest-run hint, if it is known
    pub fn largest_hint(&self) -> Option<FreeRun> {
        match self.largest {
            LargestRun::Known(run) => Some(run),
            LargestRun::Unknown => None,
        }
    }

    /// Check if a block (group-relative) is allocated
    pub fn is_allocated(&self, offset: u32) -> bool {
        if offset >= self.num_blocks {
            return false;
        }
        self.bitmaps[(offset / self.bits_per_block) as usize].is_set(offset % self.bits_per_block)
    }

    /// Whether every block of the range is allocated
    pub fn is_range_allocated(&self, start: u32, length: u32) -> bool {
        self.first_clear(start, length).is_none()
    }

    /// Mark `[start, start + length)` allocated and stage the touched bitmap blocks
    ///
    /// The new images are staged before memory changes. If staging fails,
    /// blocks already staged get their previous image back and the bitmap is
    /// left untouched.
    pub fn allocate(&mut self, txn: &mut dyn Transaction, start: u32, length: u32) -> Result<()> {
        self.check_range(start, length)?;

        if self.first_set(start, length).is_some() {
            return Err(AllocError::InsufficientSpace {
                group: self.index,
                start,
                end: start + length,
            });
        }

        self.stage_change(txn, start, length, true)?;
        self.mark_allocated(start, length);
        Ok(())
    }

    /// Mark `[start, start + length)` free and stage the touched bitmap blocks
    ///
    /// Every block must currently be allocated; otherwise nothing changes and
    /// `DoubleFree` names the first block that was already free.
    pub fn free(&mut self, txn: &mut dyn Transaction, start: u32, length: u32) -> Result<()> {
        self.check_range(start, length)?;

        if let Some(block) = self.first_clear(start, length) {
            return Err(AllocError::DoubleFree {
                group: self.index,
                block,
            });
        }

        self.stage_change(txn, start, length, false)?;
        self.mark_free(start, length);
        Ok(())
    }

    /// Set bits of a rolled-back free again, in memory only
    pub(crate) fn restore_allocated(&mut self, start: u32, length: u32) -> Result<()> {
        self.check_range(start, length)?;
        if self.first_set(start, length).is_some() {
            return Err(AllocError::InsufficientSpace {
                group: self.index,
                start,
                end: start + length,
            });
        }
        self.mark_allocated(start, length);
        Ok(())
    }

    /// Clear bits of a rolled-back allocation, in memory only
    pub(crate) fn restore_free(&mut self, start: u32, length: u32) -> Result<()> {
        self.check_range(start, length)?;
        if let Some(block) = self.first_clear(start, length) {
            return Err(AllocError::DoubleFree {
                group: self.index,
                block,
            });
        }
        self.mark_free(start, length);
        Ok(())
    }

    /// Indices of the bitmap blocks describing `[start, start + length)`
    pub fn bitmap_blocks_for(&self, start: u32, length: u32) -> Range<usize> {
        if length == 0 {
            return 0..0;
        }
        let first = (start / self.bits_per_block) as usize;
        let last = ((start + length - 1) / self.bits_per_block) as usize;
        first..last + 1
    }

    /// Largest free run of at least `minimum` blocks (lowest start on ties)
    ///
    /// Answers from the cached hint when it is known; otherwise scans the
    /// bitmap from the start of the group and caches the result.
    pub fn find_run(&mut self, minimum: u32) -> Option<FreeRun> {
        let minimum = minimum.max(1);
        if self.free_blocks < minimum {
            return None;
        }

        let largest = match self.largest {
            LargestRun::Known(run) => run,
            LargestRun::Unknown => {
                let run = self.scan_largest();
                self.largest = LargestRun::Known(run);
                run
            }
        };

        (largest.length >= minimum).then_some(largest)
    }

    /// Length of the free run beginning exactly at `offset`, capped at `max`
    pub fn free_run_at(&self, offset: u32, max: u32) -> u32 {
        if offset >= self.num_blocks {
            return 0;
        }
        let span = max.min(self.num_blocks - offset);
        match self.first_set(offset, span) {
            Some(block) => block - offset,
            None => span,
        }
    }

    /// Number of maximal free runs
    pub fn free_run_count(&self) -> u32 {
        let mut count = 0;
        self.scan_free_runs(|_| count += 1);
        count
    }

    /// Overwrite a bitmap word; used by bitmap repair
    ///
    /// Counters are stale until [`finish_load`](Self::finish_load) is called.
    pub(crate) fn overwrite_word(&mut self, block_index: usize, word_index: usize, value: u32) {
        self.bitmaps[block_index].set_word(word_index, value);
    }

    /// Stage the current image of one bitmap block
    pub(crate) fn stage_bitmap_block(
        &self,
        txn: &mut dyn Transaction,
        block_index: usize,
    ) -> Result<()> {
        txn.stage_block(
            self.first_bitmap_block + block_index as u64,
            &self.bitmaps[block_index].to_bytes(),
        )
    }

    fn check_range(&self, start: u32, length: u32) -> Result<()> {
        if length == 0 || u64::from(start) + u64::from(length) > u64::from(self.num_blocks) {
            return Err(AllocError::OutOfRange(BlockRun::new(self.index, start, length)));
        }
        Ok(())
    }

    /// Stage the images `[start, start + length)` would produce, memory untouched
    fn stage_change(
        &self,
        txn: &mut dyn Transaction,
        start: u32,
        length: u32,
        allocate: bool,
    ) -> Result<()> {
        let spans = self.spans(start, length);
        for (n, &(i, s, l)) in spans.iter().enumerate() {
            let mut image = self.bitmaps[i].clone();
            if allocate {
                image.set_range(s, l);
            } else {
                image.clear_range(s, l);
            }

            let block = self.first_bitmap_block + i as u64;
            if let Err(e) = txn.stage_block(block, &image.to_bytes()) {
                for &(staged, _, _) in &spans[..n] {
                    if let Err(restore) = self.stage_bitmap_block(txn, staged) {
                        error!(
                            "Cannot restore staged bitmap block {} of group {}: {}",
                            staged, self.index, restore
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn mark_allocated(&mut self, start: u32, length: u32) {
        self.for_each_span(start, length, |bitmap, s, l| bitmap.set_range(s, l));
        self.free_blocks -= length;
        if let LargestRun::Known(run) = self.largest {
            if run.overlaps(start, length) {
                self.largest = LargestRun::Unknown;
            }
        }
    }

    fn mark_free(&mut self, start: u32, length: u32) {
        self.for_each_span(start, length, |bitmap, s, l| bitmap.clear_range(s, l));
        self.free_blocks += length;
        if let LargestRun::Known(run) = self.largest {
            let isolated = (start == 0 || self.is_allocated(start - 1))
                && (start + length == self.num_blocks || self.is_allocated(start + length));
            self.largest = if !isolated {
                LargestRun::Unknown
            } else if length > run.length || (length == run.length && start < run.start) {
                LargestRun::Known(FreeRun { start, length })
            } else {
                LargestRun::Known(run)
            };
        }
    }

    /// Split a group range into (bitmap block, local start, local length) pieces
    fn spans(&self, start: u32, length: u32) -> Vec<(usize, u32, u32)> {
        let end = start + length;
        let mut spans = Vec::new();
        let mut bit = start;
        while bit < end {
            let local = bit % self.bits_per_block;
            let count = (self.bits_per_block - local).min(end - bit);
            spans.push(((bit / self.bits_per_block) as usize, local, count));
            bit += count;
        }
        spans
    }

    fn for_each_span(&mut self, start: u32, length: u32, op: impl Fn(&mut BitmapBlock, u32, u32)) {
        for (i, s, l) in self.spans(start, length) {
            op(&mut self.bitmaps[i], s, l);
        }
    }

    fn first_set(&self, start: u32, length: u32) -> Option<u32> {
        self.spans(start, length).into_iter().find_map(|(i, s, l)| {
            self.bitmaps[i]
                .first_set_in_range(s, l)
                .map(|bit| i as u32 * self.bits_per_block + bit)
        })
    }

    fn first_clear(&self, start: u32, length: u32) -> Option<u32> {
        self.spans(start, length).into_iter().find_map(|(i, s, l)| {
            self.bitmaps[i]
                .first_clear_in_range(s, l)
                .map(|bit| i as u32 * self.bits_per_block + bit)
        })
    }

    fn scan_largest(&self) -> FreeRun {
        let mut best = FreeRun {
            start: 0,
            length: 0,
        };
        self.scan_free_runs(|run| {
            if run.length > best.length {
                best = run;
            }
        });
        best
    }

    /// Visit every maximal free run in ascending order
    fn scan_free_runs(&self, mut visit: impl FnMut(FreeRun)) {
        let mut run = FreeRun {
            start: 0,
            length: 0,
        };

        let mut close = |run: &mut FreeRun| {
            if run.length > 0 {
                visit(*run);
                run.length = 0;
            }
        };

        for (i, bitmap) in self.bitmaps.iter().enumerate() {
            let base = i as u32 * self.bits_per_block;
            for w in 0..bitmap.num_words() {
                let mask = bitmap.word_mask(w);
                let word = bitmap.word(w) & mask;
                let word_base = base + w as u32 * WORD_BITS;
                let valid = mask.count_ones();

                if word == 0 {
                    if run.length == 0 {
                        run.start = word_base;
                    }
                    run.length += valid;
                    continue;
                }
                if word == mask {
                    close(&mut run);
                    continue;
                }

                for bit in 0..valid {
                    if word & (1u32 << bit) != 0 {
                        close(&mut run);
                    } else {
                        if run.length == 0 {
                            run.start = word_base + bit;
                        }
                        run.length += 1;
                    }
                }
            }
        }
        close(&mut run);
    }
}
