//! Superblock (block 0) and the allocation-group geometry derived from it
//!
//! The superblock records everything the allocator needs at mount time:
//! block size, block count, group size and count, and where the bitmap and
//! log regions live. All fields are little-endian; the first 64 bytes are
//! covered by a CRC32 stored at offset 64.

use crate::error::{AllocError, Result};
use crate::io::BlockDevice;
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const MAGIC: [u8; 8] = *b"BFSALLOC";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Bytes covered by the superblock checksum
const CHECKSUM_OFFSET: usize = 64;

/// Encoded superblock length (fields + checksum)
pub const SUPERBLOCK_LEN: usize = CHECKSUM_OFFSET + 4;

/// Allocation-group geometry of a volume
///
/// Groups all have `blocks_per_group` blocks except the last one, which
/// holds whatever remains. Each group owns `bitmap_blocks_per_group`
/// consecutive bitmap blocks starting at
/// `bitmap_start + group * bitmap_blocks_per_group`; the last group may use
/// fewer of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub block_size: u32,
    pub num_blocks: u64,
    pub blocks_per_group: u32,
    pub num_groups: u32,
    pub bitmap_start: u64,
    pub bitmap_blocks_per_group: u32,
    pub log_start: u64,
    pub log_length: u32,
}

impl VolumeGeometry {
    /// Lay out a volume: superblock at 0, bitmap from block 1, log after the bitmap
    pub fn layout(
        block_size: u32,
        num_blocks: u64,
        blocks_per_group: u32,
        log_length: u32,
    ) -> Result<Self> {
        validate_block_size(block_size)?;
        if blocks_per_group == 0 {
            return Err(AllocError::CorruptGeometry(
                "blocks per group must be non-zero".into(),
            ));
        }
        if num_blocks == 0 {
            return Err(AllocError::CorruptGeometry("volume has no blocks".into()));
        }

        let bits = u64::from(block_size) * 8;
        let num_groups = num_blocks.div_ceil(u64::from(blocks_per_group));
        let num_groups = u32::try_from(num_groups).map_err(|_| {
            AllocError::CorruptGeometry(format!("{} allocation groups is too many", num_groups))
        })?;
        let bitmap_blocks_per_group = u64::from(blocks_per_group).div_ceil(bits) as u32;

        let mut geometry = VolumeGeometry {
            block_size,
            num_blocks,
            blocks_per_group,
            num_groups,
            bitmap_start: 1,
            bitmap_blocks_per_group,
            log_start: 0,
            log_length,
        };
        geometry.log_start = geometry.bitmap_start + geometry.total_bitmap_blocks();
        geometry.validate()?;
        Ok(geometry)
    }

    /// Number of bits (blocks) one bitmap block describes
    pub fn bits_per_bitmap_block(&self) -> u32 {
        self.block_size * 8
    }

    /// First absolute block of a group
    pub fn group_start(&self, group: u32) -> u64 {
        u64::from(group) * u64::from(self.blocks_per_group)
    }

    /// Number of blocks governed by a group (last group may be shorter)
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let remaining = self.num_blocks.saturating_sub(self.group_start(group));
        remaining.min(u64::from(self.blocks_per_group)) as u32
    }

    /// Number of bitmap blocks actually backing a group
    pub fn bitmap_blocks_in_group(&self, group: u32) -> u32 {
        self.blocks_in_group(group)
            .div_ceil(self.bits_per_bitmap_block())
    }

    /// Absolute block number of a group's first bitmap block
    pub fn first_bitmap_block(&self, group: u32) -> u64 {
        self.bitmap_start + u64::from(group) * u64::from(self.bitmap_blocks_per_group)
    }

    /// Bitmap blocks in use across all groups
    pub fn total_bitmap_blocks(&self) -> u64 {
        (0..self.num_groups)
            .map(|g| u64::from(self.bitmap_blocks_in_group(g)))
            .sum()
    }

    /// Block ranges that are allocated at format time and never freed
    pub fn reserved_ranges(&self) -> Vec<Range<u64>> {
        let bitmap_end = self.bitmap_start.saturating_add(self.total_bitmap_blocks());
        let mut ranges = vec![0..bitmap_end];
        if self.log_length > 0 {
            let log = self.log_start..self.log_start.saturating_add(u64::from(self.log_length));
            if log.start == bitmap_end {
                ranges[0].end = log.end;
            } else {
                ranges.push(log);
            }
        }
        ranges
    }

    /// Total number of reserved blocks
    pub fn reserved_blocks(&self) -> u64 {
        self.reserved_ranges().iter().map(|r| r.end - r.start).sum()
    }

    /// Split an absolute block number into (group, offset)
    pub fn block_to_group(&self, block: u64) -> Option<(u32, u32)> {
        if block >= self.num_blocks {
            return None;
        }
        let bpg = u64::from(self.blocks_per_group);
        Some(((block / bpg) as u32, (block % bpg) as u32))
    }

    /// Check the geometry is self-consistent
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)?;

        if self.blocks_per_group == 0 {
            return Err(AllocError::CorruptGeometry(
                "blocks per group must be non-zero".into(),
            ));
        }

        let expected_groups = self.num_blocks.div_ceil(u64::from(self.blocks_per_group));
        if u64::from(self.num_groups) != expected_groups {
            return Err(AllocError::CorruptGeometry(format!(
                "{} groups of {} blocks do not cover {} blocks (expected {} groups)",
                self.num_groups, self.blocks_per_group, self.num_blocks, expected_groups
            )));
        }

        let covered: u64 = (0..self.num_groups)
            .map(|g| u64::from(self.blocks_in_group(g)))
            .sum();
        if covered != self.num_blocks {
            return Err(AllocError::CorruptGeometry(format!(
                "group sizes sum to {} blocks, volume has {}",
                covered, self.num_blocks
            )));
        }

        let needed = self.blocks_per_group.div_ceil(self.bits_per_bitmap_block());
        if self.bitmap_blocks_per_group != needed {
            return Err(AllocError::CorruptGeometry(format!(
                "{} bitmap blocks per group do not describe {} blocks (expected {})",
                self.bitmap_blocks_per_group, self.blocks_per_group, needed
            )));
        }

        if self.bitmap_start == 0 {
            return Err(AllocError::CorruptGeometry(
                "bitmap overlaps the superblock".into(),
            ));
        }

        let bitmap_end = self
            .bitmap_start
            .checked_add(self.total_bitmap_blocks())
            .ok_or_else(|| {
                AllocError::CorruptGeometry(format!(
                    "bitmap start {} is past the end of any volume",
                    self.bitmap_start
                ))
            })?;
        let log_end = self
            .log_start
            .checked_add(u64::from(self.log_length))
            .ok_or_else(|| {
                AllocError::CorruptGeometry(format!(
                    "log of {} blocks at {} is past the end of any volume",
                    self.log_length, self.log_start
                ))
            })?;
        if self.log_length > 0 && self.log_start < bitmap_end {
            return Err(AllocError::CorruptGeometry(format!(
                "log at {} overlaps the bitmap ending at {}",
                self.log_start, bitmap_end
            )));
        }
        if bitmap_end.max(log_end) >= self.num_blocks {
            return Err(AllocError::CorruptGeometry(format!(
                "reserved area ({} blocks) leaves no room in a {}-block volume",
                bitmap_end.max(log_end),
                self.num_blocks
            )));
        }

        Ok(())
    }
}

fn validate_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(AllocError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// On-disk superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub geometry: VolumeGeometry,
    /// Allocated blocks, reserved ones included
    pub used_blocks: u64,
}

impl Superblock {
    pub fn new(geometry: VolumeGeometry) -> Self {
        Superblock {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            used_blocks: geometry.reserved_blocks(),
            geometry,
        }
    }

    /// Validate magic, version and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(AllocError::InvalidMagic);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(AllocError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        self.geometry.validate()?;

        if self.used_blocks > self.geometry.num_blocks {
            return Err(AllocError::CorruptGeometry(format!(
                "used blocks ({}) exceeds total blocks ({})",
                self.used_blocks, self.geometry.num_blocks
            )));
        }

        Ok(())
    }

    /// Serialize to a full block
    pub fn to_bytes(&self) -> Vec<u8> {
        let g = &self.geometry;
        let mut bytes = Vec::with_capacity(g.block_size as usize);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&g.block_size.to_le_bytes());
        bytes.extend_from_slice(&g.num_blocks.to_le_bytes());
        bytes.extend_from_slice(&self.used_blocks.to_le_bytes());
        bytes.extend_from_slice(&g.blocks_per_group.to_le_bytes());
        bytes.extend_from_slice(&g.num_groups.to_le_bytes());
        bytes.extend_from_slice(&g.bitmap_start.to_le_bytes());
        bytes.extend_from_slice(&g.bitmap_blocks_per_group.to_le_bytes());
        bytes.extend_from_slice(&g.log_start.to_le_bytes());
        bytes.extend_from_slice(&g.log_length.to_le_bytes());
        debug_assert_eq!(bytes.len(), CHECKSUM_OFFSET);

        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        bytes.resize((g.block_size as usize).max(SUPERBLOCK_LEN), 0);
        bytes
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_LEN {
            return Err(AllocError::Io {
                block: Some(0),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Insufficient bytes for superblock",
                ),
            });
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(AllocError::InvalidMagic);
        }

        let stored = read_u32(bytes, CHECKSUM_OFFSET);
        if crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) != stored {
            return Err(AllocError::ChecksumMismatch);
        }

        let superblock = Superblock {
            magic,
            version_major: read_u16(bytes, 8),
            version_minor: read_u16(bytes, 10),
            geometry: VolumeGeometry {
                block_size: read_u32(bytes, 12),
                num_blocks: read_u64(bytes, 16),
                blocks_per_group: read_u32(bytes, 32),
                num_groups: read_u32(bytes, 36),
                bitmap_start: read_u64(bytes, 40),
                bitmap_blocks_per_group: read_u32(bytes, 48),
                log_start: read_u64(bytes, 52),
                log_length: read_u32(bytes, 60),
            },
            used_blocks: read_u64(bytes, 24),
        };

        superblock.validate()?;
        Ok(superblock)
    }

    /// Read and validate block 0 of a device
    pub fn read<D: BlockDevice + ?Sized>(device: &D) -> Result<Self> {
        let mut block = vec![0u8; device.block_size()];
        device.read_block(0, &mut block)?;
        Self::from_bytes(&block)
    }

    /// Write to block 0 of a device (no sync)
    pub fn write<D: BlockDevice + ?Sized>(&self, device: &D) -> Result<()> {
        device.write_block(0, &self.to_bytes())
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
