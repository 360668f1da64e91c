//! Transactions: atomic units of block writes
//!
//! The allocator never writes bitmap blocks to the device itself. Every
//! allocate/free stages the new contents of each touched bitmap block into
//! a caller-supplied [`Transaction`] and records the bit change it made;
//! the caller later commits or rolls back.

use crate::allocator::BlockRun;
use crate::error::Result;
use crate::io::BlockDevice;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// One bitmap change made on behalf of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapChange {
    Allocated(BlockRun),
    Freed(BlockRun),
}

impl BitmapChange {
    pub fn run(&self) -> BlockRun {
        match *self {
            BitmapChange::Allocated(run) | BitmapChange::Freed(run) => run,
        }
    }
}

/// Atomic-commit unit the allocator stages bitmap block images into
pub trait Transaction {
    /// Identifier used in log output
    fn id(&self) -> u64;

    /// Stage the full new contents of `block`
    ///
    /// Staging the same block again replaces the earlier image.
    fn stage_block(&mut self, block: u64, data: &[u8]) -> Result<()>;

    /// Remember a bitmap change, in order, so a rollback can undo it
    fn record_change(&mut self, change: BitmapChange);
}

/// Transaction that buffers staged blocks in memory until commit
///
/// Commit writes blocks in ascending order and syncs the device. Rollback
/// discards the buffered images and hands back the recorded changes so the
/// allocator can undo them (see `BlockAllocator::revert`).
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    write_cache: BTreeMap<u64, Vec<u8>>,
    changes: Vec<BitmapChange>,
}

impl MemoryTransaction {
    pub fn new() -> Self {
        MemoryTransaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            write_cache: BTreeMap::new(),
            changes: Vec::new(),
        }
    }

    /// Staged block numbers in ascending order
    pub fn staged_blocks(&self) -> Vec<u64> {
        self.write_cache.keys().copied().collect()
    }

    /// Staged image of a block, if any
    pub fn staged(&self, block: u64) -> Option<&[u8]> {
        self.write_cache.get(&block).map(Vec::as_slice)
    }

    /// Bitmap changes in the order they were made
    pub fn changes(&self) -> &[BitmapChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.write_cache.is_empty()
    }

    pub fn len(&self) -> usize {
        self.write_cache.len()
    }

    /// Write every staged block and sync; returns the number of blocks written
    pub fn commit<D: BlockDevice + ?Sized>(self, device: &D) -> Result<usize> {
        let count = self.write_cache.len();
        for (block, data) in &self.write_cache {
            device.write_block(*block, data)?;
        }
        device.sync()?;
        tracing::debug!("Transaction {} committed {} block(s)", self.id, count);
        Ok(count)
    }

    /// Discard all staged blocks; returns the recorded bitmap changes
    pub fn rollback(self) -> Vec<BitmapChange> {
        tracing::debug!(
            "Transaction {} rolled back {} block(s), {} bitmap change(s)",
            self.id,
            self.write_cache.len(),
            self.changes.len()
        );
        self.changes
    }
}

impl Default for MemoryTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn stage_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.write_cache.insert(block, data.to_vec());
        Ok(())
    }

    fn record_change(&mut self, change: BitmapChange) {
        self.changes.push(change);
    }
}
