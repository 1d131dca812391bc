use std::convert::TryInto;

use crate::fs::SFSError;
use crate::layout::{Geometry, BLOCK_SIZE, SB_MAGIC};

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Keeps the size of every region so the mount side can locate the inode store
/// and both bitmaps without recomputing anything, plus the two free counters
/// which change on every allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// A 32-bit identifying constant, `0xDEADCE11`.
    pub magic: u32,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

fn le32(buf: &[u8], field: usize) -> u32 {
    let start = field * 4;
    // Fixed offsets inside a buffer whose length was checked by the caller.
    u32::from_le_bytes(buf[start..start + 4].try_into().unwrap())
}

impl SuperBlock {
    /// Superblock of a freshly formatted device: only the root inode and its
    /// entry block are in use.
    pub fn new(geo: &Geometry) -> Self {
        Self {
            magic: SB_MAGIC,
            nr_blocks: geo.nr_blocks,
            nr_inodes: geo.nr_inodes,
            nr_istore_blocks: geo.nr_istore_blocks,
            nr_ifree_blocks: geo.nr_ifree_blocks,
            nr_bfree_blocks: geo.nr_bfree_blocks,
            nr_free_inodes: geo.nr_inodes - 1,
            nr_free_blocks: geo.nr_data_blocks - 1,
        }
    }

    /// Reads the super block from a buffer of exactly size BLOCK_SIZE.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` on a wrong buffer size or magic constant.
    pub fn parse(buf: &[u8]) -> Result<Self, SFSError> {
        if buf.len() != BLOCK_SIZE {
            return Err(SFSError::CorruptMetadata(format!(
                "superblock buffer is {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }

        let magic = le32(buf, 0);
        if magic != SB_MAGIC {
            return Err(SFSError::CorruptMetadata(format!(
                "wrong magic number {:#x}",
                magic
            )));
        }

        Ok(Self {
            magic,
            nr_blocks: le32(buf, 1),
            nr_inodes: le32(buf, 2),
            nr_istore_blocks: le32(buf, 3),
            nr_ifree_blocks: le32(buf, 4),
            nr_bfree_blocks: le32(buf, 5),
            nr_free_inodes: le32(buf, 6),
            nr_free_blocks: le32(buf, 7),
        })
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    /// The encoding is a series of little endian struct fields padded with zeros.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sb_encoded = Vec::with_capacity(BLOCK_SIZE);
        for field in &[
            self.magic,
            self.nr_blocks,
            self.nr_inodes,
            self.nr_istore_blocks,
            self.nr_ifree_blocks,
            self.nr_bfree_blocks,
            self.nr_free_inodes,
            self.nr_free_blocks,
        ] {
            sb_encoded.extend_from_slice(&field.to_le_bytes());
        }
        sb_encoded.resize(BLOCK_SIZE, 0);
        sb_encoded
    }

    /// Checks the stored region sizes against the layout recomputed from
    /// `nr_blocks`, returning that layout.
    pub fn geometry(&self) -> Result<Geometry, SFSError> {
        let geo = Geometry::compute(self.nr_blocks)
            .map_err(|e| SFSError::CorruptMetadata(format!("bad nr_blocks: {}", e)))?;

        let stored = (
            self.nr_inodes,
            self.nr_istore_blocks,
            self.nr_ifree_blocks,
            self.nr_bfree_blocks,
        );
        let expected = (
            geo.nr_inodes,
            geo.nr_istore_blocks,
            geo.nr_ifree_blocks,
            geo.nr_bfree_blocks,
        );
        if stored != expected {
            return Err(SFSError::CorruptMetadata(format!(
                "superblock regions {:?} do not match device geometry {:?}",
                stored, expected
            )));
        }

        if self.nr_free_inodes >= geo.nr_inodes || self.nr_free_blocks >= geo.nr_data_blocks {
            return Err(SFSError::CorruptMetadata(format!(
                "free counters out of range (inodes {}/{}, blocks {}/{})",
                self.nr_free_inodes, geo.nr_inodes, self.nr_free_blocks, geo.nr_data_blocks
            )));
        }
        Ok(geo)
    }
}
