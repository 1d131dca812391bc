//! Logical to physical block mapping for regular files.
//!
//! Every file with content owns exactly one index block holding up to
//! `MAX_EXTENTS` extent records sorted by logical start. A record with zero
//! length ends the list. There is no second level: once the index block is
//! full and the next run can't be merged into its predecessor, the file can
//! not grow any more.
use crate::fs::SFSError;
use crate::layout::{BLOCK_SIZE, EXTENT_SIZE, MAX_EXTENTS};

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type Le32 = U32<LittleEndian>;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawExtent {
    ee_block: Le32,
    ee_len: Le32,
    ee_start: Le32,
}

/// A run of `ee_len` physically contiguous blocks starting at `ee_start`,
/// holding the file's logical blocks `ee_block..ee_block + ee_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub ee_block: u32,
    pub ee_len: u32,
    pub ee_start: u32,
}

impl Extent {
    /// One past the last logical block.
    pub fn logical_end(&self) -> u32 {
        self.ee_block + self.ee_len
    }

    /// One past the last physical block.
    pub fn physical_end(&self) -> u32 {
        self.ee_start + self.ee_len
    }

    fn contains(&self, logical: u32) -> bool {
        self.ee_block <= logical && logical < self.logical_end()
    }
}

/// In-memory copy of one inode's index block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentIndex {
    extents: Vec<Extent>,
}

impl ExtentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an index block up to its terminating record.
    ///
    /// # Errors
    ///
    /// Unordered or overlapping extents are reported as `CorruptMetadata`.
    pub fn parse(buf: &[u8]) -> Result<Self, SFSError> {
        if buf.len() != BLOCK_SIZE {
            return Err(SFSError::CorruptMetadata(format!(
                "extent index of {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }

        let mut extents: Vec<Extent> = Vec::new();
        for record in buf.chunks_exact(EXTENT_SIZE).take(MAX_EXTENTS) {
            let raw = RawExtent::read_from(record).ok_or_else(|| {
                SFSError::CorruptMetadata("extent record is truncated".to_string())
            })?;
            if raw.ee_len.get() == 0 {
                break;
            }
            let extent = Extent {
                ee_block: raw.ee_block.get(),
                ee_len: raw.ee_len.get(),
                ee_start: raw.ee_start.get(),
            };
            if extent.ee_block.checked_add(extent.ee_len).is_none()
                || extent.ee_start.checked_add(extent.ee_len).is_none()
            {
                return Err(SFSError::CorruptMetadata(format!(
                    "extent {:?} overflows the block address space",
                    extent
                )));
            }
            if let Some(prev) = extents.last() {
                if prev.logical_end() > extent.ee_block {
                    return Err(SFSError::CorruptMetadata(format!(
                        "extent {:?} overlaps or precedes {:?}",
                        extent, prev
                    )));
                }
            }
            extents.push(extent);
        }
        Ok(Self { extents })
    }

    /// Encodes the index as a full block, zero filled after the last record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut block = vec![0; BLOCK_SIZE];
        for (extent, slot) in self.extents.iter().zip(block.chunks_exact_mut(EXTENT_SIZE)) {
            let raw = RawExtent {
                ee_block: Le32::new(extent.ee_block),
                ee_len: Le32::new(extent.ee_len),
                ee_start: Le32::new(extent.ee_start),
            };
            slot.copy_from_slice(raw.as_bytes());
        }
        block
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total number of mapped blocks.
    pub fn mapped_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.ee_len).sum()
    }

    /// Physical block backing `logical`, or `None` for an unmapped position.
    pub fn resolve(&self, logical: u32) -> Option<u32> {
        // First extent starting past `logical`; only its predecessor can cover it.
        let idx = self.extents.partition_point(|e| e.ee_block <= logical);
        let extent = self.extents[..idx].last()?;
        if extent.contains(logical) {
            Some(extent.ee_start + (logical - extent.ee_block))
        } else {
            None
        }
    }

    /// Checks that `len` blocks at `logical_start` don't collide with any
    /// mapped range, before any space is allocated for them.
    pub fn check_free_range(&self, logical_start: u32, len: u32) -> Result<(), SFSError> {
        if len == 0 {
            return Err(SFSError::InvalidArgument(
                "extent length must be positive".to_string(),
            ));
        }
        let end = logical_start.checked_add(len).ok_or_else(|| {
            SFSError::InvalidArgument(format!(
                "range {}+{} overflows the logical address space",
                logical_start, len
            ))
        })?;
        if let Some(e) = self
            .extents
            .iter()
            .find(|e| e.ee_block < end && logical_start < e.logical_end())
        {
            return Err(SFSError::InvalidArgument(format!(
                "range {}..{} overlaps mapped extent {:?}",
                logical_start, end, e
            )));
        }
        Ok(())
    }

    /// Adds `extent` in logical order. When the preceding record ends exactly
    /// where `extent` begins, both logically and physically, the record is
    /// extended instead.
    ///
    /// Returns true if the extent was merged.
    ///
    /// # Errors
    ///
    /// `IndexFull` when a new record is needed and all `MAX_EXTENTS` slots are
    /// taken. The index is unchanged on error.
    pub fn insert(&mut self, extent: Extent) -> Result<bool, SFSError> {
        self.check_free_range(extent.ee_block, extent.ee_len)?;

        let pos = self.extents.partition_point(|e| e.ee_block < extent.ee_block);
        if pos > 0 {
            let prev = &mut self.extents[pos - 1];
            if prev.logical_end() == extent.ee_block && prev.physical_end() == extent.ee_start {
                prev.ee_len += extent.ee_len;
                return Ok(true);
            }
        }

        if self.extents.len() >= MAX_EXTENTS {
            return Err(SFSError::IndexFull);
        }
        self.extents.insert(pos, extent);
        Ok(false)
    }

    /// Shrinks the mapping to the first `new_block_count` logical blocks,
    /// returning the released physical runs as `(start, len)`. Extents lying
    /// wholly past the new end are dropped and one straddling it loses its
    /// tail. Already short enough mappings are left alone.
    pub fn truncate(&mut self, new_block_count: u32) -> Vec<(u32, u32)> {
        let mut released = Vec::new();
        while let Some(last) = self.extents.last_mut() {
            if last.ee_block >= new_block_count {
                released.push((last.ee_start, last.ee_len));
                self.extents.pop();
            } else if last.logical_end() > new_block_count {
                let keep = new_block_count - last.ee_block;
                released.push((last.ee_start + keep, last.ee_len - keep));
                last.ee_len = keep;
                break;
            } else {
                break;
            }
        }
        released
    }
}
