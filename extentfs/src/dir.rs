use crate::fs::SFSError;
use crate::layout::{BLOCK_SIZE, DIR_ENTRIES_PER_BLOCK, DIR_ENTRY_SIZE, FILENAME_LEN};

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawDirEntry {
    inode: U32<LittleEndian>,
    name: [u8; FILENAME_LEN],
}

/// A name to inode association. Inode 0 is the root, which no directory
/// lists, so a zero inode number marks an unused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    name: [u8; FILENAME_LEN],
}

impl DirEntry {
    /// Builds an entry, rejecting names that can't be stored.
    pub fn new(name: &[u8], inode: u32) -> Result<Self, SFSError> {
        let stored = encode_name(name)?;
        if inode == 0 {
            return Err(SFSError::InvalidArgument(
                "directory entries can't point at the root inode".to_string(),
            ));
        }
        Ok(Self {
            inode,
            name: stored,
        })
    }

    /// The name without its zero padding.
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        &self.name[..len]
    }

    fn is_free(&self) -> bool {
        self.inode == 0
    }
}

/// Checks that `name` can be stored in a directory entry.
pub fn check_name(name: &[u8]) -> Result<(), SFSError> {
    encode_name(name).map(|_| ())
}

fn encode_name(name: &[u8]) -> Result<[u8; FILENAME_LEN], SFSError> {
    if name.len() > FILENAME_LEN {
        return Err(SFSError::NameTooLong(name.len()));
    }
    if name.is_empty() || name.contains(&0) || name.contains(&b'/') {
        return Err(SFSError::InvalidArgument(format!(
            "invalid file name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    let mut stored = [0; FILENAME_LEN];
    stored[..name.len()].copy_from_slice(name);
    Ok(stored)
}

/// The entry table of a directory, which always fits in one data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBlock {
    entries: Vec<DirEntry>,
}

impl Default for DirectoryBlock {
    fn default() -> Self {
        Self {
            entries: vec![
                DirEntry {
                    inode: 0,
                    name: [0; FILENAME_LEN],
                };
                DIR_ENTRIES_PER_BLOCK
            ],
        }
    }
}

impl DirectoryBlock {
    /// An empty table, the contents of a zeroed block.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SFSError> {
        if buf.len() != BLOCK_SIZE {
            return Err(SFSError::CorruptMetadata(format!(
                "directory block of {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }
        let entries = buf
            .chunks_exact(DIR_ENTRY_SIZE)
            .filter_map(RawDirEntry::read_from)
            .map(|raw| DirEntry {
                inode: raw.inode.get(),
                name: raw.name,
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut block = vec![0; BLOCK_SIZE];
        for (entry, slot) in self.entries.iter().zip(block.chunks_exact_mut(DIR_ENTRY_SIZE)) {
            let raw = RawDirEntry {
                inode: U32::new(entry.inode),
                name: entry.name,
            };
            slot.copy_from_slice(raw.as_bytes());
        }
        block
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| !e.is_free())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn lookup(&self, name: &[u8]) -> Result<u32, SFSError> {
        self.iter()
            .find(|e| e.name() == name)
            .map(|e| e.inode)
            .ok_or(SFSError::NotFound)
    }

    /// Stores `name` in the first unused slot.
    ///
    /// # Errors
    ///
    /// `NameTooLong` is checked before anything else. `AlreadyExists` if the
    /// name is taken and `DirectoryFull` if no slot is free.
    pub fn insert(&mut self, name: &[u8], inode: u32) -> Result<(), SFSError> {
        let entry = DirEntry::new(name, inode)?;
        if self.lookup(name).is_ok() {
            return Err(SFSError::AlreadyExists);
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.is_free())
            .ok_or(SFSError::DirectoryFull)?;
        *slot = entry;
        Ok(())
    }

    /// Tombstones the entry for `name` and returns the inode it pointed at.
    /// The slot keeps its name bytes; only the inode number is cleared.
    pub fn remove(&mut self, name: &[u8]) -> Result<u32, SFSError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.is_free() && e.name() == name)
            .ok_or(SFSError::NotFound)?;
        let inode = entry.inode;
        entry.inode = 0;
        Ok(inode)
    }
}
