//! # bfs-allocator - Block Allocation for a BFS-style Filesystem
//!
//! `bfs-allocator` manages free space on a block-based volume:
//!
//! - **Allocation groups** with on-disk bitmaps (one bit per block)
//! - **Transactional** allocate/free: every bitmap change is staged into a
//!   caller-owned transaction and reaches the disk only on commit
//! - **Placement policies**: parent-group locality for new nodes, in-place
//!   growth for files, partial allocation when space is fragmented
//! - **Online consistency check** detecting leaked, missing and cross-linked
//!   blocks, with optional bitmap repair
//! - **Package overlay**: priority-resolved merged view of package node trees
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bfs_allocator::{
//!     format_volume, AllocatorConfig, BlockAllocator, BlockRun, FileDevice, FormatOptions,
//!     MemoryTransaction, NodeKind, NodeRecord, Result,
//! };
//!
//! # fn main() -> Result<()> {
//! let device = FileDevice::create("volume.img", 2048, 65536)?;
//! format_volume(&device, &FormatOptions::with_block_size(2048))?;
//!
//! let allocator = BlockAllocator::mount(&device, AllocatorConfig::default())?;
//!
//! let mut txn = MemoryTransaction::new();
//! let inode = allocator.allocate_for_node(&mut txn, BlockRun::new(0, 0, 1), NodeKind::File)?;
//! let node = NodeRecord::new(NodeKind::File, inode);
//! let data = allocator.allocate(&mut txn, &node, 64, 1)?;
//! txn.commit(&device)?;
//!
//! println!("inode at {}, data at {}", inode, data);
//! # Ok(())
//! # }
//! ```
//!
//! ## Consistency Check
//!
//! ```rust,no_run
//! use bfs_allocator::{BlockAllocator, CheckControl, CheckOptions, NodeRecord, Result};
//!
//! # fn check(allocator: &BlockAllocator, nodes: &[NodeRecord]) -> Result<()> {
//! let mut control = CheckControl::new(CheckOptions::default());
//! allocator.start_checking(&mut control)?;
//! for node in nodes {
//!     // errors are counted in the stats; keep walking
//!     let _ = allocator.check_next_node(&mut control, node);
//! }
//! let stats = allocator.stop_checking(&mut control)?;
//! println!("{} leaked, {} missing", stats.leaked_blocks, stats.missing_blocks);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod package;
pub mod superblock;
pub mod transaction;

pub use allocator::{
    AllocatorStats, BlockAllocator, BlockRun, CheckControl, CheckOptions, CheckStats, FreeRun,
    GroupStats, NodeBlocks, NodeKind, NodeRecord,
};
pub use config::{AllocatorConfig, FormatOptions};
pub use error::{AllocError, Result};
pub use format::format_volume;
pub use io::{BlockDevice, FileDevice, MemoryDevice};
pub use package::{DependencyLink, LinkTarget, PackageManifest, PackageOverlay, ResolvedNode};
pub use superblock::{Superblock, VolumeGeometry};
pub use transaction::{BitmapChange, MemoryTransaction, Transaction};
