//! Online bitmap consistency check
//!
//! A check builds a shadow bitmap from the runs of every live node and
//! compares it with the on-disk bitmap when it is stopped:
//! - Leaked blocks are allocated on disk but claimed by no node
//! - Missing blocks are claimed by a node but free on disk
//! - Cross-linked blocks are claimed by more than one node
//!
//! Only one check may run per allocator at a time. The walk over the
//! filesystem tree belongs to the caller, which feeds each node to
//! [`BlockAllocator::check_next_node`].

use super::{split_range, BlockAllocator, BlockRun, NodeBlocks};
use crate::allocator::bitmap::WORD_BITS;
use crate::error::{AllocError, Result};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Rewrite the on-disk bitmap from the shadow bitmap when stopping
    pub fix_bitmap: bool,
}

/// Counters gathered during one check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStats {
    pub nodes_checked: u64,
    pub blocks_checked: u64,
    pub cross_linked_blocks: u64,
    pub invalid_runs: u64,
    pub leaked_blocks: u64,
    pub missing_blocks: u64,
    /// Bitmap bits rewritten by a repair
    pub repaired_blocks: u64,
}

impl CheckStats {
    /// No inconsistency of any kind was found
    pub fn is_clean(&self) -> bool {
        self.cross_linked_blocks == 0
            && self.invalid_runs == 0
            && self.leaked_blocks == 0
            && self.missing_blocks == 0
    }
}

/// Caller-owned state of one consistency check
pub struct CheckControl {
    options: CheckOptions,
    stats: CheckStats,
    state: CheckState,
}

enum CheckState {
    Idle,
    Checking(ActiveCheck),
}

struct ActiveCheck {
    /// One bit per block, per group
    shadow: Vec<Vec<u32>>,
    slot: CheckSlot,
}

/// Held while a check runs; releases the allocator on drop
struct CheckSlot(Arc<AtomicBool>);

impl Drop for CheckSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ActiveCheck {
    /// Mark a block in the shadow bitmap; returns true if it was already marked
    fn test_and_set(&mut self, group: u32, offset: u32) -> bool {
        let word = &mut self.shadow[group as usize][(offset / WORD_BITS) as usize];
        let mask = 1u32 << (offset % WORD_BITS);
        let was_set = *word & mask != 0;
        *word |= mask;
        was_set
    }
}

impl CheckControl {
    pub fn new(options: CheckOptions) -> Self {
        CheckControl {
            options,
            stats: CheckStats::default(),
            state: CheckState::Idle,
        }
    }

    pub fn options(&self) -> CheckOptions {
        self.options
    }

    /// Counters of the running check, or of the last finished one
    pub fn stats(&self) -> &CheckStats {
        &self.stats
    }

    pub fn is_checking(&self) -> bool {
        matches!(self.state, CheckState::Checking(_))
    }
}

impl Default for CheckControl {
    fn default() -> Self {
        Self::new(CheckOptions::default())
    }
}

impl BlockAllocator {
    /// Begin a consistency check
    ///
    /// Reserved blocks (superblock, bitmap, log) are pre-marked in the shadow
    /// bitmap. Fails with `InvalidState` if `control` is already checking or
    /// another check holds this allocator.
    pub fn start_checking(&self, control: &mut CheckControl) -> Result<()> {
        if control.is_checking() {
            return Err(AllocError::InvalidState("check already running on this control"));
        }
        if self
            .check_slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AllocError::InvalidState(
                "another consistency check is running",
            ));
        }

        let shadow = (0..self.geometry.num_groups)
            .map(|g| vec![0u32; self.geometry.blocks_in_group(g).div_ceil(WORD_BITS) as usize])
            .collect();
        let mut active = ActiveCheck {
            shadow,
            slot: CheckSlot(Arc::clone(&self.check_slot)),
        };

        for range in self.geometry.reserved_ranges() {
            for run in split_range(&self.geometry, range) {
                for offset in run.start..run.end() {
                    active.test_and_set(run.group, offset);
                }
            }
        }

        control.stats = CheckStats::default();
        control.state = CheckState::Checking(active);

        info!(
            "Consistency check started ({} groups, fix_bitmap={})",
            self.geometry.num_groups, control.options.fix_bitmap
        );
        Ok(())
    }

    /// Record the runs of one live node
    ///
    /// Every valid run is marked even when an error is returned, so the check
    /// can go on with the next node. Invalid runs give `OutOfRange`; blocks
    /// already claimed by an earlier node (or reserved) give
    /// `CrossLinkedBlocks`, naming the first such block.
    pub fn check_next_node(&self, control: &mut CheckControl, node: &dyn NodeBlocks) -> Result<()> {
        let CheckState::Checking(active) = &mut control.state else {
            return Err(AllocError::InvalidState("no consistency check running"));
        };
        if !Arc::ptr_eq(&active.slot.0, &self.check_slot) {
            return Err(AllocError::InvalidState(
                "check was started on another allocator",
            ));
        }
        let stats = &mut control.stats;

        let mut invalid = None;
        let mut first_cross = None;
        let mut cross = 0u64;

        let runs = std::iter::once(node.inode_run()).chain(node.data_runs().iter().copied());
        for run in runs {
            if !self.is_valid_run(&run) {
                warn!("Node {} has invalid run {}", node.inode_run(), run);
                stats.invalid_runs += 1;
                invalid.get_or_insert(run);
                continue;
            }

            for offset in run.start..run.end() {
                if active.test_and_set(run.group, offset) {
                    cross += 1;
                    first_cross.get_or_insert_with(|| {
                        self.run_to_block(&BlockRun::new(run.group, offset, 1))
                    });
                }
            }
            stats.blocks_checked += u64::from(run.length);
        }

        stats.nodes_checked += 1;
        stats.cross_linked_blocks += cross;

        if let Some(block) = first_cross {
            error!(
                "Node {} shares {} block(s) with another owner, first at {}",
                node.inode_run(),
                cross,
                block
            );
            return Err(AllocError::CrossLinkedBlocks {
                block,
                count: cross,
            });
        }
        if let Some(run) = invalid {
            return Err(AllocError::OutOfRange(run));
        }
        Ok(())
    }

    /// Finish the check and compare the shadow bitmap with the on-disk one
    ///
    /// The bitmap is never modified; see
    /// [`stop_checking_and_repair`](Self::stop_checking_and_repair).
    pub fn stop_checking(&self, control: &mut CheckControl) -> Result<CheckStats> {
        self.finish_check(control, None)
    }

    /// Finish the check and, when `fix_bitmap` is set, stage a corrected bitmap
    ///
    /// Each bitmap block that differs from the shadow bitmap is overwritten in
    /// memory and staged into `txn`.
    pub fn stop_checking_and_repair(
        &self,
        control: &mut CheckControl,
        txn: &mut dyn Transaction,
    ) -> Result<CheckStats> {
        self.finish_check(control, Some(txn))
    }

    fn finish_check(
        &self,
        control: &mut CheckControl,
        mut txn: Option<&mut dyn Transaction>,
    ) -> Result<CheckStats> {
        match &control.state {
            CheckState::Idle => {
                return Err(AllocError::InvalidState("no consistency check running"));
            }
            CheckState::Checking(active) if !Arc::ptr_eq(&active.slot.0, &self.check_slot) => {
                return Err(AllocError::InvalidState(
                    "check was started on another allocator",
                ));
            }
            CheckState::Checking(_) => {}
        }
        let CheckState::Checking(active) = std::mem::replace(&mut control.state, CheckState::Idle)
        else {
            return Err(AllocError::InvalidState("no consistency check running"));
        };

        let repair = control.options.fix_bitmap && txn.is_some();
        let words_per_block = (self.geometry.bits_per_bitmap_block() / WORD_BITS) as usize;
        let stats = &mut control.stats;

        let mut groups = self.groups.lock();
        for (group, shadow) in groups.iter_mut().zip(&active.shadow) {
            let mut dirty = vec![false; group.bitmap_block_count()];

            for (w, &expected) in shadow.iter().enumerate() {
                let (block_index, word_index) = (w / words_per_block, w % words_per_block);
                let bitmap = group.bitmap_block(block_index);
                let mask = bitmap.word_mask(word_index);
                let actual = bitmap.word(word_index) & mask;
                let expected = expected & mask;

                let leaked = actual & !expected;
                let missing = expected & !actual;
                if leaked | missing == 0 {
                    continue;
                }
                stats.leaked_blocks += u64::from(leaked.count_ones());
                stats.missing_blocks += u64::from(missing.count_ones());

                if repair {
                    group.overwrite_word(block_index, word_index, expected);
                    dirty[block_index] = true;
                    stats.repaired_blocks += u64::from((leaked | missing).count_ones());
                }
            }

            if dirty.contains(&true) {
                group.finish_load();
                if let Some(txn) = txn.as_deref_mut() {
                    for (i, _) in dirty.iter().enumerate().filter(|(_, d)| **d) {
                        group.stage_bitmap_block(txn, i)?;
                    }
                }
                debug!("Repaired bitmap of group {}", group.index());
            }
        }
        drop(groups);

        if stats.leaked_blocks > 0 || stats.missing_blocks > 0 {
            warn!(
                "Bitmap mismatch: {} leaked, {} missing block(s){}",
                stats.leaked_blocks,
                stats.missing_blocks,
                if repair { " (repaired)" } else { "" }
            );
        }
        info!(
            "Consistency check finished: {} nodes, {} blocks checked",
            stats.nodes_checked, stats.blocks_checked
        );

        Ok(stats.clone())
    }
}
