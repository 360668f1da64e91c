//! bfs-check
//!
//! Format volume images, print allocator statistics, and run the bitmap
//! consistency check against a node list produced by a tree walker.

use anyhow::{bail, Context};
use bfs_allocator::superblock::MIN_BLOCK_SIZE;
use bfs_allocator::{
    format_volume, AllocatorConfig, BlockAllocator, BlockDevice, CheckControl, CheckOptions,
    FileDevice, FormatOptions, MemoryTransaction, NodeRecord, Superblock,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bfs-check")]
#[command(about = "Format, inspect and check BFS-style allocator volumes")]
struct Args {
    /// Path to the volume image
    #[arg(short = 'i', long)]
    image: PathBuf,

    /// Allocator policy file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and format a new image
    Format {
        /// Number of blocks
        #[arg(short = 'b', long)]
        blocks: u64,

        /// Block size in bytes
        #[arg(long, default_value = "2048")]
        block_size: u32,

        /// Blocks per allocation group [default: block_size * 8]
        #[arg(long)]
        blocks_per_group: Option<u32>,

        /// Journal blocks reserved after the bitmap
        #[arg(long, default_value = "512")]
        log_blocks: u32,
    },

    /// Print usage and fragmentation as JSON
    Stats,

    /// Check the bitmap against a JSON list of nodes
    Check {
        /// JSON array of nodes ({"kind", "inode_run", "data_runs"})
        #[arg(short = 'n', long)]
        nodes: PathBuf,

        /// Rewrite the bitmap to match the nodes
        #[arg(long)]
        fix: bool,
    },
}

/// Open an image, reading the block size from its superblock
fn open_volume(path: &Path) -> anyhow::Result<FileDevice> {
    let probe = FileDevice::open(path, MIN_BLOCK_SIZE as usize)
        .with_context(|| format!("opening {:?}", path))?;
    let mut block = vec![0u8; probe.block_size()];
    probe.read_block(0, &mut block)?;
    let superblock = Superblock::from_bytes(&block).context("reading superblock")?;
    drop(probe);

    Ok(FileDevice::open(path, superblock.geometry.block_size as usize)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AllocatorConfig::load(path)
            .with_context(|| format!("loading allocator config {:?}", path))?,
        None => AllocatorConfig::default(),
    };

    match args.command {
        Command::Format {
            blocks,
            block_size,
            blocks_per_group,
            log_blocks,
        } => {
            let options = FormatOptions {
                block_size,
                blocks_per_group: blocks_per_group.unwrap_or(block_size * 8),
                log_blocks,
            };
            info!("Creating image {:?} ({} blocks)", args.image, blocks);
            let device = FileDevice::create(&args.image, block_size as usize, blocks)?;
            let superblock = format_volume(&device, &options)?;
            println!("{}", serde_json::to_string_pretty(&superblock.geometry)?);
        }

        Command::Stats => {
            let device = open_volume(&args.image)?;
            let allocator = BlockAllocator::mount(&device, config)?;
            println!("{}", serde_json::to_string_pretty(&allocator.stats())?);
        }

        Command::Check { nodes, fix } => {
            let text = std::fs::read_to_string(&nodes)
                .with_context(|| format!("reading node list {:?}", nodes))?;
            let nodes: Vec<NodeRecord> = serde_json::from_str(&text)?;

            let device = open_volume(&args.image)?;
            let allocator = BlockAllocator::mount(&device, config)?;

            let mut control = CheckControl::new(CheckOptions { fix_bitmap: fix });
            allocator.start_checking(&mut control)?;
            for node in &nodes {
                if let Err(e) = allocator.check_next_node(&mut control, node) {
                    warn!("Node {}: {}", node.inode_run, e);
                }
            }

            let stats = if fix {
                let mut txn = MemoryTransaction::new();
                let stats = allocator.stop_checking_and_repair(&mut control, &mut txn)?;
                let mut superblock = Superblock::read(&device)?;
                allocator.stage_superblock(&mut txn, &mut superblock)?;
                let written = txn.commit(&device)?;
                info!("Wrote {} repaired block(s)", written);
                stats
            } else {
                allocator.stop_checking(&mut control)?
            };

            println!("{}", serde_json::to_string_pretty(&stats)?);
            if !stats.is_clean() && !fix {
                bail!("volume is inconsistent; rerun with --fix to repair the bitmap");
            }
        }
    }

    Ok(())
}
