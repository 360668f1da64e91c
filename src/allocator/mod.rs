//! Block allocation over allocation groups
//!
//! The volume is split into fixed-size allocation groups, each with its own
//! slice of the free-space bitmap. [`BlockAllocator`] owns every group behind
//! a single lock and implements the placement policies:
//! - New nodes go into their parent's group (directory locality)
//! - Growing files continue right after their last run when possible
//! - Otherwise groups are searched from the preferred one upwards, wrapping
//!   around, and a shorter run (≥ the caller's minimum) is accepted when no
//!   group can satisfy the whole request

pub mod bitmap;
pub mod check;
pub mod group;

pub use check::{CheckControl, CheckOptions, CheckStats};
pub use group::{AllocationGroup, FreeRun};

use crate::config::AllocatorConfig;
use crate::error::{AllocError, Result};
use crate::io::BlockDevice;
use crate::superblock::{Superblock, VolumeGeometry};
use crate::transaction::{BitmapChange, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A contiguous span of blocks inside one allocation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRun {
    pub group: u32,
    pub start: u32,
    pub length: u32,
}

impl BlockRun {
    pub fn new(group: u32, start: u32, length: u32) -> Self {
        BlockRun {
            group,
            start,
            length,
        }
    }

    /// Group-relative offset one past the last block
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.length)
    }

    /// Check if two runs share a block
    pub fn overlaps(&self, other: &BlockRun) -> bool {
        self.group == other.group && self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for BlockRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.group, self.start, self.length)
    }
}

/// Kind of node a run is allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// Block runs claimed by a live filesystem node
pub trait NodeBlocks {
    /// Run holding the node itself
    fn inode_run(&self) -> BlockRun;

    /// Runs holding the node's data, in file order
    fn data_runs(&self) -> &[BlockRun];
}

/// Plain description of a node, as produced by a tree walker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub inode_run: BlockRun,
    #[serde(default)]
    pub data_runs: Vec<BlockRun>,
}

impl NodeRecord {
    pub fn new(kind: NodeKind, inode_run: BlockRun) -> Self {
        NodeRecord {
            kind,
            inode_run,
            data_runs: Vec::new(),
        }
    }
}

impl NodeBlocks for NodeRecord {
    fn inode_run(&self) -> BlockRun {
        self.inode_run
    }

    fn data_runs(&self) -> &[BlockRun] {
        &self.data_runs
    }
}

/// Per-group usage figures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStats {
    pub index: u32,
    pub blocks: u32,
    pub free_blocks: u32,
    pub free_runs: u32,
}

/// Allocator-wide usage figures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    /// 0.0 = all free space in one run, higher = more scattered
    pub fragmentation: f64,
    pub groups: Vec<GroupStats>,
}

/// Block allocator for one mounted volume
pub struct BlockAllocator {
    geometry: VolumeGeometry,
    config: AllocatorConfig,
    /// Every group and its bitmap cache; one lock for all of them
    groups: Mutex<Vec<AllocationGroup>>,
    /// Set while a consistency check holds the allocator
    check_slot: Arc<AtomicBool>,
}

impl BlockAllocator {
    /// Build the groups for `geometry` and load their bitmap blocks from `device`
    pub fn initialize<D: BlockDevice + ?Sized>(
        device: &D,
        geometry: VolumeGeometry,
        config: AllocatorConfig,
    ) -> Result<Self> {
        geometry.validate()?;
        config.validate()?;

        let block_size = geometry.block_size as usize;
        if device.block_size() != block_size {
            return Err(AllocError::CorruptGeometry(format!(
                "device block size {} does not match volume block size {}",
                device.block_size(),
                block_size
            )));
        }
        if device.block_count() < geometry.num_blocks {
            return Err(AllocError::CorruptGeometry(format!(
                "device has {} blocks, volume needs {}",
                device.block_count(),
                geometry.num_blocks
            )));
        }

        let mut buffer = vec![0u8; block_size];
        let mut groups = Vec::with_capacity(geometry.num_groups as usize);
        for g in 0..geometry.num_groups {
            let mut group = AllocationGroup::new(
                g,
                geometry.blocks_in_group(g),
                geometry.bitmap_blocks_in_group(g),
                geometry.first_bitmap_block(g),
                block_size,
            );
            for i in 0..group.bitmap_block_count() {
                let block = group.first_bitmap_block() + i as u64;
                read_bitmap_block(device, block, &mut buffer)?;
                group.load_bitmap_block(i, &buffer);
            }
            group.finish_load();
            groups.push(group);
        }

        let allocator = BlockAllocator {
            geometry,
            config,
            groups: Mutex::new(groups),
            check_slot: Arc::new(AtomicBool::new(false)),
        };

        if allocator.config.verify_reserved {
            allocator.verify_reserved()?;
        }

        info!(
            "Allocator initialized: {} groups of {} blocks, {} of {} blocks used",
            geometry.num_groups,
            geometry.blocks_per_group,
            allocator.used_blocks(),
            geometry.num_blocks
        );

        Ok(allocator)
    }

    /// Read the superblock from block 0 and initialize from its geometry
    pub fn mount<D: BlockDevice + ?Sized>(device: &D, config: AllocatorConfig) -> Result<Self> {
        let superblock = Superblock::read(device)?;
        let allocator = Self::initialize(device, superblock.geometry, config)?;

        let used = allocator.used_blocks();
        if used != superblock.used_blocks {
            warn!(
                "Superblock reports {} used blocks, bitmap has {}",
                superblock.used_blocks, used
            );
        }

        Ok(allocator)
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn group_count(&self) -> u32 {
        self.geometry.num_groups
    }

    /// Allocate the run for a new node near its parent
    ///
    /// The node lands in the parent's group when possible (directories are
    /// shifted by `directory_group_offset` groups); otherwise the following
    /// groups are tried in order, wrapping around.
    pub fn allocate_for_node(
        &self,
        txn: &mut dyn Transaction,
        parent: BlockRun,
        kind: NodeKind,
    ) -> Result<BlockRun> {
        let mut preferred = parent.group;
        if kind == NodeKind::Directory {
            preferred = preferred.wrapping_add(self.config.directory_group_offset);
        }
        let preferred = preferred % self.geometry.num_groups;
        let blocks = self.config.node_blocks;

        let mut groups = self.groups.lock();
        let run = Self::allocate_in_groups(&mut groups, txn, preferred, blocks, blocks)?;
        debug!(
            "Allocated {:?} node run {} (parent {}, txn {})",
            kind,
            run,
            parent,
            txn.id()
        );
        Ok(run)
    }

    /// Allocate up to `requested` contiguous blocks for `node`, accepting any run ≥ `minimum`
    ///
    /// A shorter run than requested is not an error: callers growing a large
    /// file on a fragmented volume loop until they have everything.
    /// `DeviceFull` means not even `minimum` blocks were available anywhere.
    pub fn allocate(
        &self,
        txn: &mut dyn Transaction,
        node: &dyn NodeBlocks,
        requested: u32,
        minimum: u32,
    ) -> Result<BlockRun> {
        if requested == 0 || minimum == 0 || minimum > requested {
            return Err(AllocError::InvalidRequest(format!(
                "cannot allocate {} blocks with a minimum of {}",
                requested, minimum
            )));
        }
        if minimum > self.geometry.blocks_per_group {
            return Err(AllocError::InvalidRequest(format!(
                "minimum of {} blocks exceeds the group size of {}",
                minimum, self.geometry.blocks_per_group
            )));
        }
        let requested = requested.min(self.geometry.blocks_per_group);

        let (preferred, goal) = match node.data_runs().last() {
            Some(last) if self.is_valid_run(last) => (last.group, Some(last.end())),
            Some(last) => (last.group, None),
            None => (node.inode_run().group, None),
        };
        let preferred = preferred % self.geometry.num_groups;

        let mut groups = self.groups.lock();

        if self.config.contiguous_growth {
            if let Some(goal) = goal {
                let group = &mut groups[preferred as usize];
                if group.free_run_at(goal, requested) == requested {
                    group.allocate(txn, goal, requested)?;
                    let run = BlockRun::new(preferred, goal, requested);
                    txn.record_change(BitmapChange::Allocated(run));
                    debug!("Extended node in place with run {} (txn {})", run, txn.id());
                    return Ok(run);
                }
            }
        }

        let run = Self::allocate_in_groups(&mut groups, txn, preferred, requested, minimum)?;
        if run.length < requested {
            debug!(
                "Partial allocation {} ({} of {} blocks requested, txn {})",
                run,
                run.length,
                requested,
                txn.id()
            );
        } else {
            debug!("Allocated run {} (txn {})", run, txn.id());
        }
        Ok(run)
    }

    /// Group search shared by both allocation entry points
    fn allocate_in_groups(
        groups: &mut [AllocationGroup],
        txn: &mut dyn Transaction,
        preferred: u32,
        requested: u32,
        minimum: u32,
    ) -> Result<BlockRun> {
        let count = groups.len();
        let mut best: Option<(usize, FreeRun)> = None;

        for i in 0..count {
            let g = (preferred as usize + i) % count;
            let Some(run) = groups[g].find_run(minimum) else {
                continue;
            };
            if run.length >= requested {
                best = Some((g, run));
                break;
            }
            if best.map_or(true, |(_, b)| run.length > b.length) {
                best = Some((g, run));
            }
        }

        let Some((g, run)) = best else {
            warn!(
                "Device full: no free run of {} blocks (requested {})",
                minimum, requested
            );
            return Err(AllocError::DeviceFull { requested, minimum });
        };

        let length = run.length.min(requested);
        groups[g].allocate(txn, run.start, length)?;
        let run = BlockRun::new(g as u32, run.start, length);
        txn.record_change(BitmapChange::Allocated(run));
        Ok(run)
    }

    /// Release a run
    ///
    /// `DoubleFree` means the on-disk structures are corrupt; it is logged
    /// and handed back to the caller unchanged.
    pub fn free(&self, txn: &mut dyn Transaction, run: BlockRun) -> Result<()> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(run.group as usize)
            .ok_or(AllocError::OutOfRange(run))?;

        match group.free(txn, run.start, run.length) {
            Ok(()) => {
                txn.record_change(BitmapChange::Freed(run));
                debug!("Freed run {} (txn {})", run, txn.id());
                Ok(())
            }
            Err(e) => {
                if e.is_corruption() {
                    error!("Freeing run {} failed: {}", run, e);
                }
                Err(e)
            }
        }
    }

    /// Whether a run lies inside a known group
    pub fn is_valid_run(&self, run: &BlockRun) -> bool {
        run.group < self.geometry.num_groups
            && run.length > 0
            && u64::from(run.start) + u64::from(run.length)
                <= u64::from(self.geometry.blocks_in_group(run.group))
    }

    /// Whether every block of a run is marked allocated
    pub fn is_run_allocated(&self, run: &BlockRun) -> Result<bool> {
        if !self.is_valid_run(run) {
            return Err(AllocError::OutOfRange(*run));
        }
        let groups = self.groups.lock();
        Ok(groups[run.group as usize].is_range_allocated(run.start, run.length))
    }

    /// Absolute block number of a run's first block
    pub fn run_to_block(&self, run: &BlockRun) -> u64 {
        self.geometry.group_start(run.group) + u64::from(run.start)
    }

    /// Run of `length` blocks starting at an absolute block, if it stays in one group
    pub fn block_to_run(&self, block: u64, length: u32) -> Option<BlockRun> {
        let (group, start) = self.geometry.block_to_group(block)?;
        let run = BlockRun::new(group, start, length);
        self.is_valid_run(&run).then_some(run)
    }

    /// Split an absolute block range into per-group runs
    pub fn runs_for_range(&self, range: Range<u64>) -> Vec<BlockRun> {
        split_range(&self.geometry, range)
    }

    pub fn free_blocks(&self) -> u64 {
        let groups = self.groups.lock();
        groups.iter().map(|g| u64::from(g.free_blocks())).sum()
    }

    pub fn used_blocks(&self) -> u64 {
        self.geometry.num_blocks - self.free_blocks()
    }

    /// Record the current used-block count in `superblock` and stage block 0
    pub fn stage_superblock(
        &self,
        txn: &mut dyn Transaction,
        superblock: &mut Superblock,
    ) -> Result<()> {
        superblock.used_blocks = self.used_blocks();
        txn.stage_block(0, &superblock.to_bytes())
    }

    /// Undo the bitmap changes of a rolled-back transaction, newest first
    ///
    /// Only the listed runs change, so uncommitted work of other transactions
    /// in the same bitmap blocks is kept. Returns the bitmap blocks whose
    /// in-memory image changed; transactions still open that staged one of
    /// them can pick up the corrected image with
    /// [`restage_bitmap_blocks`](Self::restage_bitmap_blocks).
    ///
    /// A freed run that another transaction has allocated since cannot be
    /// taken back. It is left alone, the other changes are still undone, and
    /// `CrossLinkedBlocks` is returned afterwards.
    pub fn revert<I>(&self, changes: I) -> Result<Vec<u64>>
    where
        I: IntoIterator<Item = BitmapChange>,
    {
        let changes: Vec<BitmapChange> = changes.into_iter().collect();
        let mut groups = self.groups.lock();
        let mut touched = Vec::new();
        let mut failure = None;

        for change in changes.iter().rev() {
            let run = change.run();
            let Some(group) = groups.get_mut(run.group as usize) else {
                error!("Cannot revert {:?}: no such group", change);
                failure.get_or_insert(AllocError::OutOfRange(run));
                continue;
            };

            let result = match change {
                BitmapChange::Allocated(_) => group.restore_free(run.start, run.length),
                BitmapChange::Freed(_) => {
                    match group.restore_allocated(run.start, run.length) {
                        Err(AllocError::InsufficientSpace { .. }) => {
                            let taken: Vec<u32> = (run.start..run.end())
                                .filter(|&b| group.is_allocated(b))
                                .collect();
                            let first = taken.first().copied().unwrap_or(run.start);
                            Err(AllocError::CrossLinkedBlocks {
                                block: self.run_to_block(&BlockRun::new(run.group, first, 1)),
                                count: taken.len() as u64,
                            })
                        }
                        other => other,
                    }
                }
            };

            match result {
                Ok(()) => {
                    let first = group.first_bitmap_block();
                    touched.extend(
                        group
                            .bitmap_blocks_for(run.start, run.length)
                            .map(|i| first + i as u64),
                    );
                }
                Err(e) => {
                    error!("Cannot revert {:?}: {}", change, e);
                    failure.get_or_insert(e);
                }
            }
        }

        touched.sort_unstable();
        touched.dedup();
        if !touched.is_empty() {
            info!(
                "Reverted {} bitmap change(s) in {} bitmap block(s)",
                changes.len(),
                touched.len()
            );
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(touched),
        }
    }

    /// Stage the current in-memory image of the given bitmap blocks
    ///
    /// Blocks outside the bitmap region are ignored.
    pub fn restage_bitmap_blocks(&self, txn: &mut dyn Transaction, blocks: &[u64]) -> Result<()> {
        let groups = self.groups.lock();
        for &block in blocks {
            if let Some((g, i)) = self.locate_bitmap_block(&groups, block) {
                groups[g].stage_bitmap_block(txn, i)?;
            }
        }
        Ok(())
    }

    /// (group, bitmap block index) of an absolute bitmap block number
    fn locate_bitmap_block(&self, groups: &[AllocationGroup], block: u64) -> Option<(usize, usize)> {
        let offset = block.checked_sub(self.geometry.bitmap_start)?;
        let per_group = u64::from(self.geometry.bitmap_blocks_per_group);
        let g = usize::try_from(offset / per_group).ok()?;
        let i = (offset % per_group) as usize;
        (i < groups.get(g)?.bitmap_block_count()).then_some((g, i))
    }

    /// Usage and fragmentation figures
    pub fn stats(&self) -> AllocatorStats {
        let groups = self.groups.lock();
        let group_stats: Vec<GroupStats> = groups
            .iter()
            .map(|g| GroupStats {
                index: g.index(),
                blocks: g.num_blocks(),
                free_blocks: g.free_blocks(),
                free_runs: g.free_run_count(),
            })
            .collect();

        let free_blocks: u64 = group_stats.iter().map(|g| u64::from(g.free_blocks)).sum();
        let free_runs: u64 = group_stats.iter().map(|g| u64::from(g.free_runs)).sum();

        // Ideal = 1 run per group; worst = every free block its own run
        let fragmentation = if free_blocks == 0 {
            0.0
        } else {
            let ideal = group_stats.iter().filter(|g| g.free_blocks > 0).count() as f64;
            (free_runs as f64 - ideal) / (free_blocks as f64).max(1.0)
        };

        AllocatorStats {
            block_size: self.geometry.block_size,
            total_blocks: self.geometry.num_blocks,
            used_blocks: self.geometry.num_blocks - free_blocks,
            free_blocks,
            fragmentation,
            groups: group_stats,
        }
    }

    fn verify_reserved(&self) -> Result<()> {
        let groups = self.groups.lock();
        for range in self.geometry.reserved_ranges() {
            for run in split_range(&self.geometry, range) {
                let group = &groups[run.group as usize];
                if !group.is_range_allocated(run.start, run.length) {
                    return Err(AllocError::CorruptGeometry(format!(
                        "reserved run {} is not marked allocated",
                        run
                    )));
                }
            }
        }
        Ok(())
    }
}

fn read_bitmap_block<D: BlockDevice + ?Sized>(
    device: &D,
    block: u64,
    buffer: &mut [u8],
) -> Result<()> {
    device.read_block(block, buffer).map_err(|e| match e {
        AllocError::Io { source, .. } => AllocError::io_at(block, source),
        other => other,
    })
}

/// Split an absolute block range into per-group runs
pub(crate) fn split_range(geometry: &VolumeGeometry, range: Range<u64>) -> Vec<BlockRun> {
    let end = range.end.min(geometry.num_blocks);
    let mut runs = Vec::new();
    let mut block = range.start;
    while block < end {
        let Some((group, start)) = geometry.block_to_group(block) else {
            break;
        };
        let in_group = u64::from(geometry.blocks_in_group(group) - start);
        let length = in_group.min(end - block);
        runs.push(BlockRun::new(group, start, length as u32));
        block += length;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_volume;
    use crate::config::FormatOptions;
    use crate::io::MemoryDevice;
    use crate::transaction::MemoryTransaction;

    /// 4 groups of 1024 blocks, 512-byte blocks, 16 reserved blocks in group 0
    fn setup() -> (MemoryDevice, BlockAllocator) {
        let dev = MemoryDevice::new(512, 4096);
        let options = FormatOptions {
            block_size: 512,
            blocks_per_group: 1024,
            log_blocks: 11,
        };
        format_volume(&dev, &options).unwrap();
        let alloc = BlockAllocator::mount(&dev, AllocatorConfig::default()).unwrap();
        (dev, alloc)
    }

    fn node_in(group: u32) -> NodeRecord {
        NodeRecord::new(NodeKind::File, BlockRun::new(group, 0, 1))
    }

    #[test]
    fn test_block_run_overlap() {
        let a = BlockRun::new(0, 10, 10);
        assert!(a.overlaps(&BlockRun::new(0, 19, 5)));
        assert!(!a.overlaps(&BlockRun::new(0, 20, 5)));
        assert!(!a.overlaps(&BlockRun::new(1, 10, 10)));
        assert_eq!(a.to_string(), "0:10+10");
    }

    #[test]
    fn test_mount_counts_reserved() {
        let (_dev, alloc) = setup();
        assert_eq!(alloc.group_count(), 4);
        assert_eq!(alloc.used_blocks(), 16);
        assert_eq!(alloc.free_blocks(), 4096 - 16);
        assert!(alloc.is_run_allocated(&BlockRun::new(0, 0, 16)).unwrap());
    }

    #[test]
    fn test_allocate_for_node_prefers_parent_group() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();

        let run = alloc
            .allocate_for_node(&mut txn, BlockRun::new(2, 5, 1), NodeKind::File)
            .unwrap();
        assert_eq!(run, BlockRun::new(2, 0, 1));

        let run = alloc
            .allocate_for_node(&mut txn, BlockRun::new(0, 0, 1), NodeKind::Directory)
            .unwrap();
        assert_eq!(run, BlockRun::new(0, 16, 1));
    }

    #[test]
    fn test_directory_group_offset() {
        let dev = MemoryDevice::new(512, 4096);
        let options = FormatOptions {
            block_size: 512,
            blocks_per_group: 1024,
            log_blocks: 11,
        };
        format_volume(&dev, &options).unwrap();
        let config = AllocatorConfig {
            directory_group_offset: 3,
            ..AllocatorConfig::default()
        };
        let alloc = BlockAllocator::mount(&dev, config).unwrap();
        let mut txn = MemoryTransaction::new();

        let run = alloc
            .allocate_for_node(&mut txn, BlockRun::new(2, 0, 1), NodeKind::Directory)
            .unwrap();
        assert_eq!(run.group, 1); // (2 + 3) % 4
    }

    #[test]
    fn test_fallback_wraps_from_preferred_group() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();

        // fill groups 2 and 3
        for g in 2..4 {
            alloc.allocate(&mut txn, &node_in(g), 1024, 1024).unwrap();
        }

        // group 2 preferred, 3 full, wraps to 0
        let run = alloc
            .allocate_for_node(&mut txn, BlockRun::new(2, 0, 1), NodeKind::File)
            .unwrap();
        assert_eq!(run.group, 0);
    }

    #[test]
    fn test_partial_allocation() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();

        // leave exactly one 30-block free run on the volume
        alloc.allocate(&mut txn, &node_in(0), 1008, 1008).unwrap();
        for g in 1..4 {
            alloc.allocate(&mut txn, &node_in(g), 1024, 1024).unwrap();
        }
        alloc
            .free(&mut txn, BlockRun::new(1, 500, 30))
            .unwrap();

        let run = alloc.allocate(&mut txn, &node_in(0), 100, 10).unwrap();
        assert_eq!(run, BlockRun::new(1, 500, 30));

        let err = alloc.allocate(&mut txn, &node_in(0), 100, 10).unwrap_err();
        assert!(matches!(err, AllocError::DeviceFull { requested: 100, minimum: 10 }));
    }

    #[test]
    fn test_partial_prefers_largest_run() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        alloc.allocate(&mut txn, &node_in(0), 1008, 1008).unwrap();
        for g in 1..4 {
            alloc.allocate(&mut txn, &node_in(g), 1024, 1024).unwrap();
        }
        alloc.free(&mut txn, BlockRun::new(1, 0, 20)).unwrap();
        alloc.free(&mut txn, BlockRun::new(3, 100, 40)).unwrap();

        let run = alloc.allocate(&mut txn, &node_in(1), 100, 10).unwrap();
        assert_eq!(run, BlockRun::new(3, 100, 40));
    }

    #[test]
    fn test_contiguous_growth() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();

        // group 1: free [0, 900), file data at [900, 910), free [910, 1024)
        alloc.allocate(&mut txn, &node_in(1), 1024, 1024).unwrap();
        alloc.free(&mut txn, BlockRun::new(1, 0, 900)).unwrap();
        alloc.free(&mut txn, BlockRun::new(1, 910, 114)).unwrap();

        let mut node = node_in(1);
        node.data_runs.push(BlockRun::new(1, 900, 10));
        let grown = alloc.allocate(&mut txn, &node, 8, 1).unwrap();
        assert_eq!(grown, BlockRun::new(1, 910, 8));

        // a node without data gets the largest run
        let fresh = alloc.allocate(&mut txn, &node_in(1), 8, 1).unwrap();
        assert_eq!(fresh, BlockRun::new(1, 0, 8));
    }

    #[test]
    fn test_growth_skipped_for_invalid_last_run() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();

        // group 7 does not exist; 7 % 4 picks group 3 but not offset 910
        let mut node = node_in(1);
        node.data_runs.push(BlockRun::new(7, 900, 10));
        let run = alloc.allocate(&mut txn, &node, 8, 1).unwrap();
        assert_eq!(run, BlockRun::new(3, 0, 8));
    }

    #[test]
    fn test_contiguous_growth_disabled() {
        let dev = MemoryDevice::new(512, 4096);
        let options = FormatOptions {
            block_size: 512,
            blocks_per_group: 1024,
            log_blocks: 11,
        };
        format_volume(&dev, &options).unwrap();
        let config = AllocatorConfig {
            contiguous_growth: false,
            ..AllocatorConfig::default()
        };
        let alloc = BlockAllocator::mount(&dev, config).unwrap();
        let mut txn = MemoryTransaction::new();

        alloc.allocate(&mut txn, &node_in(1), 1024, 1024).unwrap();
        alloc.free(&mut txn, BlockRun::new(1, 0, 900)).unwrap();
        alloc.free(&mut txn, BlockRun::new(1, 910, 114)).unwrap();

        let mut node = node_in(1);
        node.data_runs.push(BlockRun::new(1, 900, 10));
        let run = alloc.allocate(&mut txn, &node, 8, 1).unwrap();
        assert_eq!(run, BlockRun::new(1, 0, 8));
    }

    #[test]
    fn test_invalid_requests() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        let node = node_in(0);

        assert!(matches!(
            alloc.allocate(&mut txn, &node, 0, 0),
            Err(AllocError::InvalidRequest(_))
        ));
        assert!(matches!(
            alloc.allocate(&mut txn, &node, 5, 10),
            Err(AllocError::InvalidRequest(_))
        ));
        assert!(matches!(
            alloc.allocate(&mut txn, &node, 5000, 2000),
            Err(AllocError::InvalidRequest(_))
        ));

        // oversized requests are clamped to a group
        let run = alloc.allocate(&mut txn, &node_in(3), 5000, 1).unwrap();
        assert_eq!(run, BlockRun::new(3, 0, 1024));
    }

    #[test]
    fn test_free_unknown_group() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        assert!(matches!(
            alloc.free(&mut txn, BlockRun::new(9, 0, 1)),
            Err(AllocError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_double_free_is_corruption() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        let run = alloc.allocate(&mut txn, &node_in(1), 10, 10).unwrap();
        alloc.free(&mut txn, run).unwrap();

        let err = alloc.free(&mut txn, run).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_commit_and_remount() {
        let (dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        let run = alloc.allocate(&mut txn, &node_in(2), 100, 100).unwrap();
        txn.commit(&dev).unwrap();

        let remounted = BlockAllocator::mount(&dev, AllocatorConfig::default()).unwrap();
        assert!(remounted.is_run_allocated(&run).unwrap());
        assert_eq!(remounted.used_blocks(), alloc.used_blocks());
    }

    #[test]
    fn test_revert_after_rollback() {
        let (_dev, alloc) = setup();
        let before = alloc.used_blocks();

        let mut txn = MemoryTransaction::new();
        let run = alloc.allocate(&mut txn, &node_in(2), 100, 100).unwrap();
        assert_eq!(alloc.used_blocks(), before + 100);

        let touched = alloc.revert(txn.rollback()).unwrap();
        assert_eq!(touched, vec![alloc.geometry().first_bitmap_block(2)]);
        assert_eq!(alloc.used_blocks(), before);
        assert!(!alloc.is_run_allocated(&run).unwrap());
    }

    #[test]
    fn test_revert_keeps_other_transaction_in_same_bitmap_block() {
        let (dev, alloc) = setup();
        let before = alloc.used_blocks();

        let mut a = MemoryTransaction::new();
        let mut b = MemoryTransaction::new();
        let ra = alloc.allocate(&mut a, &node_in(1), 10, 10).unwrap();
        let rb = alloc.allocate(&mut b, &node_in(1), 10, 10).unwrap();
        assert_eq!(ra, BlockRun::new(1, 0, 10));
        assert_eq!(rb, BlockRun::new(1, 10, 10));

        let touched = alloc.revert(a.rollback()).unwrap();
        assert!(!alloc.is_run_allocated(&ra).unwrap());
        assert!(alloc.is_run_allocated(&rb).unwrap());
        assert_eq!(alloc.used_blocks(), before + 10);

        // b staged its image while a's run was still set
        alloc.restage_bitmap_blocks(&mut b, &touched).unwrap();
        b.commit(&dev).unwrap();

        let remounted = BlockAllocator::mount(&dev, AllocatorConfig::default()).unwrap();
        assert!(remounted.is_run_allocated(&rb).unwrap());
        assert!(!remounted.is_run_allocated(&BlockRun::new(1, 0, 1)).unwrap());
        assert_eq!(remounted.used_blocks(), before + 10);
    }

    #[test]
    fn test_revert_replays_newest_first() {
        let (_dev, alloc) = setup();
        let before = alloc.used_blocks();

        let mut txn = MemoryTransaction::new();
        let run = alloc.allocate(&mut txn, &node_in(2), 50, 50).unwrap();
        alloc.free(&mut txn, run).unwrap();
        let again = alloc.allocate(&mut txn, &node_in(2), 20, 20).unwrap();
        assert_eq!(txn.changes().len(), 3);

        alloc.revert(txn.rollback()).unwrap();
        assert_eq!(alloc.used_blocks(), before);
        assert!(!alloc.is_run_allocated(&again).unwrap());
    }

    #[test]
    fn test_revert_of_free_taken_by_another_transaction() {
        let (dev, alloc) = setup();
        let mut setup_txn = MemoryTransaction::new();
        let owned = alloc.allocate(&mut setup_txn, &node_in(1), 10, 10).unwrap();
        setup_txn.commit(&dev).unwrap();

        let mut a = MemoryTransaction::new();
        alloc.free(&mut a, owned).unwrap();
        let mut b = MemoryTransaction::new();
        let taken = alloc.allocate(&mut b, &node_in(1), 10, 10).unwrap();
        assert_eq!(taken, owned);

        match alloc.revert(a.rollback()) {
            Err(AllocError::CrossLinkedBlocks { block, count }) => {
                assert_eq!(block, alloc.run_to_block(&owned));
                assert_eq!(count, 10);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(alloc.is_run_allocated(&taken).unwrap());
    }

    #[test]
    fn test_restage_ignores_non_bitmap_blocks() {
        let (_dev, alloc) = setup();
        let mut txn = MemoryTransaction::new();
        alloc.restage_bitmap_blocks(&mut txn, &[0, 2, 10, 4000]).unwrap();
        assert_eq!(txn.staged_blocks(), vec![2]);
    }

    #[test]
    fn test_stage_superblock() {
        let (dev, alloc) = setup();
        let mut sb = Superblock::read(&dev).unwrap();

        let mut txn = MemoryTransaction::new();
        alloc.allocate(&mut txn, &node_in(1), 10, 10).unwrap();
        alloc.stage_superblock(&mut txn, &mut sb).unwrap();
        txn.commit(&dev).unwrap();

        assert_eq!(Superblock::read(&dev).unwrap().used_blocks, 26);
    }

    #[test]
    fn test_block_run_conversion() {
        let (_dev, alloc) = setup();
        assert_eq!(alloc.run_to_block(&BlockRun::new(2, 10, 1)), 2058);
        assert_eq!(alloc.block_to_run(2058, 4), Some(BlockRun::new(2, 10, 4)));
        assert_eq!(alloc.block_to_run(1020, 10), None);
        assert_eq!(
            alloc.runs_for_range(1000..1100),
            vec![BlockRun::new(0, 1000, 24), BlockRun::new(1, 0, 76)]
        );
    }

    #[test]
    fn test_stats() {
        let (_dev, alloc) = setup();
        let stats = alloc.stats();
        assert_eq!(stats.total_blocks, 4096);
        assert_eq!(stats.used_blocks, 16);
        assert_eq!(stats.groups.len(), 4);
        assert_eq!(stats.fragmentation, 0.0);

        let mut txn = MemoryTransaction::new();
        let a = alloc.allocate(&mut txn, &node_in(1), 10, 10).unwrap();
        alloc.allocate(&mut txn, &node_in(1), 10, 10).unwrap();
        alloc.free(&mut txn, a).unwrap();
        assert!(alloc.stats().fragmentation > 0.0);
    }
}
