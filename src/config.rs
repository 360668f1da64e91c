//! Allocator policy and format options
//!
//! Both structs load from TOML; every field is optional and falls back to
//! its default.
//!
//! ```toml
//! node_blocks = 1
//! directory_group_offset = 0
//! contiguous_growth = true
//! verify_reserved = true
//! ```

use crate::error::{AllocError, Result};
use crate::superblock::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placement policy of a mounted allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Blocks allocated for each new node
    pub node_blocks: u32,

    /// Groups to skip past the parent's group when placing a directory
    pub directory_group_offset: u32,

    /// Try to extend a node right after its last run before searching
    pub contiguous_growth: bool,

    /// Refuse to mount if superblock, bitmap or log blocks are marked free
    pub verify_reserved: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            node_blocks: 1,
            directory_group_offset: 0,
            contiguous_growth: true,
            verify_reserved: true,
        }
    }
}

impl AllocatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AllocatorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_blocks == 0 {
            return Err(AllocError::InvalidRequest(
                "node_blocks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Volume layout chosen at format time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub block_size: u32,
    pub blocks_per_group: u32,
    /// Blocks reserved for the journal, right after the bitmap
    pub log_blocks: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            block_size: 2048,
            blocks_per_group: 2048 * 8,
            log_blocks: 512,
        }
    }
}

impl FormatOptions {
    /// Defaults for a block size: one bitmap block per group
    pub fn with_block_size(block_size: u32) -> Self {
        FormatOptions {
            block_size,
            blocks_per_group: block_size * 8,
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: FormatOptions = toml::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(AllocError::InvalidBlockSize(self.block_size));
        }
        if self.blocks_per_group == 0 {
            return Err(AllocError::InvalidRequest(
                "blocks_per_group must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.node_blocks, 1);
        assert_eq!(config.directory_group_offset, 0);
        assert!(config.contiguous_growth);

        let options = FormatOptions::default();
        assert_eq!(options.blocks_per_group, 16384);
    }

    #[test]
    fn test_partial_toml() {
        let config = AllocatorConfig::from_toml_str("directory_group_offset = 2").unwrap();
        assert_eq!(config.directory_group_offset, 2);
        assert_eq!(config.node_blocks, 1);
        assert!(config.verify_reserved);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            AllocatorConfig::from_toml_str("node_blocks = \"many\""),
            Err(AllocError::Config(_))
        ));
        assert!(matches!(
            AllocatorConfig::from_toml_str("node_blocks = 0"),
            Err(AllocError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_format_options_validation() {
        assert!(matches!(
            FormatOptions::from_toml_str("block_size = 3000"),
            Err(AllocError::InvalidBlockSize(3000))
        ));
        let options = FormatOptions::with_block_size(4096);
        assert_eq!(options.blocks_per_group, 32768);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "node_blocks = 4\ncontiguous_growth = false").unwrap();

        let config = AllocatorConfig::load(file.path()).unwrap();
        assert_eq!(config.node_blocks, 4);
        assert!(!config.contiguous_growth);
    }
}
