//! Volume formatting
//!
//! Lays out the superblock, the bitmap and the log on an empty device and
//! marks those blocks allocated. Every bitmap block is rewritten, so stale
//! contents of a reused image are cleared.

use crate::allocator::{split_range, AllocationGroup};
use crate::config::FormatOptions;
use crate::error::{AllocError, Result};
use crate::io::BlockDevice;
use crate::superblock::{Superblock, VolumeGeometry};
use crate::transaction::{MemoryTransaction, Transaction};
use tracing::info;

/// Format `device` and return the superblock written to block 0
pub fn format_volume<D: BlockDevice + ?Sized>(
    device: &D,
    options: &FormatOptions,
) -> Result<Superblock> {
    options.validate()?;
    if device.block_size() != options.block_size as usize {
        return Err(AllocError::CorruptGeometry(format!(
            "device block size {} does not match requested block size {}",
            device.block_size(),
            options.block_size
        )));
    }

    let geometry = VolumeGeometry::layout(
        options.block_size,
        device.block_count(),
        options.blocks_per_group,
        options.log_blocks,
    )?;

    let mut groups: Vec<AllocationGroup> = (0..geometry.num_groups)
        .map(|g| {
            AllocationGroup::new(
                g,
                geometry.blocks_in_group(g),
                geometry.bitmap_blocks_in_group(g),
                geometry.first_bitmap_block(g),
                options.block_size as usize,
            )
        })
        .collect();

    let mut txn = MemoryTransaction::new();
    for range in geometry.reserved_ranges() {
        for run in split_range(&geometry, range) {
            groups[run.group as usize].allocate(&mut txn, run.start, run.length)?;
        }
    }
    for group in &groups {
        for i in 0..group.bitmap_block_count() {
            group.stage_bitmap_block(&mut txn, i)?;
        }
    }

    let superblock = Superblock::new(geometry);
    txn.stage_block(0, &superblock.to_bytes())?;
    txn.commit(device)?;

    info!(
        "Formatted volume: {} blocks of {} bytes, {} groups, {} reserved",
        geometry.num_blocks,
        geometry.block_size,
        geometry.num_groups,
        superblock.used_blocks
    );

    Ok(superblock)
}
