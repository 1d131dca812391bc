//! Partition geometry and the fixed sizes of every on-disk record.
//!
//! # Layout
//! ==========================================================================
//! | SuperBlock | Inode store | Bitmap (inodes) | Bitmap (blocks) | Data    |
//! ==========================================================================
//!
//! The superblock always occupies block 0 and every other region follows it
//! without gaps, so the whole layout can be recomputed from the device size.
use crate::fs::SFSError;

pub const BLOCK_SIZE: usize = 4096;

pub const SB_MAGIC: u32 = 0xDEAD_CE11;

pub const SUPERBLOCK_INDEX: u32 = 0;

/// Ten 32-bit fields followed by the inline data area.
pub const INODE_SIZE: usize = 72;
pub const INODE_DATA_LEN: usize = 32;
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;

pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

pub const EXTENT_SIZE: usize = 12;
/// Maximum number of extents held by a single index block.
pub const MAX_EXTENTS: usize = BLOCK_SIZE / EXTENT_SIZE;

pub const FILENAME_LEN: usize = 28;
pub const DIR_ENTRY_SIZE: usize = 4 + FILENAME_LEN;
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// Devices smaller than this are refused by the formatter.
pub const MIN_BLOCKS: u32 = 100;

pub const ROOT_INO: u32 = 0;

/// Returns ceil(a / b).
const fn idiv_ceil(a: u32, b: u32) -> u32 {
    let ret = a / b;
    if a % b != 0 {
        ret + 1
    } else {
        ret
    }
}

/// Block counts of every region of a formatted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_data_blocks: u32,
}

impl Geometry {
    /// Computes the partition layout for a device of `nr_blocks` blocks.
    ///
    /// # Errors
    ///
    /// Returns `DeviceTooSmall` when the device is below `MIN_BLOCKS` or the
    /// metadata regions leave no room for data.
    pub fn compute(nr_blocks: u32) -> Result<Self, SFSError> {
        if nr_blocks < MIN_BLOCKS {
            return Err(SFSError::DeviceTooSmall {
                blocks: nr_blocks,
                min: MIN_BLOCKS,
            });
        }

        // One inode per block, rounded up to fill the last inode store block.
        let mut nr_inodes = nr_blocks;
        let rem = nr_inodes % INODES_PER_BLOCK;
        if rem != 0 {
            nr_inodes += INODES_PER_BLOCK - rem;
        }

        let nr_istore_blocks = idiv_ceil(nr_inodes, INODES_PER_BLOCK);
        let nr_ifree_blocks = idiv_ceil(nr_inodes, BITS_PER_BLOCK);
        let nr_bfree_blocks = idiv_ceil(nr_blocks, BITS_PER_BLOCK);

        let metadata = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks;
        if metadata >= nr_blocks {
            return Err(SFSError::DeviceTooSmall {
                blocks: nr_blocks,
                min: MIN_BLOCKS,
            });
        }

        Ok(Self {
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_data_blocks: nr_blocks - metadata,
        })
    }

    pub fn istore_start(&self) -> u32 {
        SUPERBLOCK_INDEX + 1
    }

    pub fn ifree_start(&self) -> u32 {
        self.istore_start() + self.nr_istore_blocks
    }

    pub fn bfree_start(&self) -> u32 {
        self.ifree_start() + self.nr_ifree_blocks
    }

    /// The first block after the metadata region. The root directory's entry
    /// block is always placed here.
    pub fn first_data_block(&self) -> u32 {
        self.bfree_start() + self.nr_bfree_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_disk_format() {
        assert_eq!(INODES_PER_BLOCK, 56);
        assert_eq!(MAX_EXTENTS, 341);
        assert_eq!(DIR_ENTRIES_PER_BLOCK, 128);
        assert_eq!(BITS_PER_BLOCK, 32768);
    }

    #[test]
    fn regions_add_up_for_all_device_sizes() {
        for nr_blocks in (MIN_BLOCKS..5000).chain([32768, 32769, 65536, 200_000]) {
            let geo = Geometry::compute(nr_blocks).unwrap();
            assert_eq!(
                geo.nr_blocks,
                1 + geo.nr_istore_blocks + geo.nr_ifree_blocks + geo.nr_bfree_blocks
                    + geo.nr_data_blocks
            );
            assert_eq!(geo.nr_inodes % INODES_PER_BLOCK, 0);
            assert!(geo.nr_inodes >= nr_blocks);
            assert!(geo.nr_inodes <= geo.nr_ifree_blocks * BITS_PER_BLOCK);
            assert!(geo.nr_blocks <= geo.nr_bfree_blocks * BITS_PER_BLOCK);
        }
    }

    #[test]
    fn fifty_mib_device_layout() {
        let geo = Geometry::compute(50 * 1024 * 1024 / BLOCK_SIZE as u32).unwrap();
        assert_eq!(geo.nr_blocks, 12800);
        assert_eq!(geo.nr_inodes, 12824);
        assert_eq!(geo.nr_istore_blocks, 229);
        assert_eq!(geo.nr_ifree_blocks, 1);
        assert_eq!(geo.nr_bfree_blocks, 1);
        assert_eq!(geo.nr_data_blocks, 12568);
        assert_eq!(geo.first_data_block(), 232);
    }

    #[test]
    fn small_devices_are_rejected() {
        match Geometry::compute(MIN_BLOCKS - 1) {
            Err(SFSError::DeviceTooSmall { blocks, min }) => {
                assert_eq!(blocks, MIN_BLOCKS - 1);
                assert_eq!(min, MIN_BLOCKS);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(Geometry::compute(0).is_err());
        assert!(Geometry::compute(MIN_BLOCKS).is_ok());
    }
}
