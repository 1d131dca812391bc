use crate::fs::SFSError;
use crate::io::{BlockBuffer, BlockStorage};
use crate::layout::{Geometry, INODES_PER_BLOCK, INODE_DATA_LEN, INODE_SIZE};

use log::debug;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// rwxr-xr-x directory, the mode given to the root at format time.
pub const ROOT_DEFAULT_MODE: u32 = S_IFDIR | 0o755;

type Le32 = U32<LittleEndian>;

/// The on-disk inode record. Must stay exactly `INODE_SIZE` bytes.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawInode {
    i_mode: Le32,
    i_uid: Le32,
    i_gid: Le32,
    i_size: Le32,
    i_ctime: Le32,
    i_atime: Le32,
    i_mtime: Le32,
    i_blocks: Le32,
    i_nlink: Le32,
    ei_block: Le32,
    i_data: [u8; INODE_DATA_LEN],
}

/// Metadata describing one file system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    /// File type and permission bits (e.g. drwxr-xr-x).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// The total size of the file in bytes.
    pub size: u32,
    /// Times in seconds since epoch.
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    /// Number of data blocks mapped to this inode.
    pub blocks: u32,
    pub nlink: u32,
    /// For regular files the extent index block, 0 while the file has no
    /// content. For directories the block holding the entry table.
    pub ei_block: u32,
    /// Inline payload, used for symlink targets.
    pub data: [u8; INODE_DATA_LEN],
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// An all-zero record marks a free slot.
    pub fn is_empty(&self) -> bool {
        *self == Inode::default()
    }

    fn decode(raw: &RawInode) -> Self {
        Self {
            mode: raw.i_mode.get(),
            uid: raw.i_uid.get(),
            gid: raw.i_gid.get(),
            size: raw.i_size.get(),
            ctime: raw.i_ctime.get(),
            atime: raw.i_atime.get(),
            mtime: raw.i_mtime.get(),
            blocks: raw.i_blocks.get(),
            nlink: raw.i_nlink.get(),
            ei_block: raw.ei_block.get(),
            data: raw.i_data,
        }
    }

    fn encode(&self) -> RawInode {
        RawInode {
            i_mode: Le32::new(self.mode),
            i_uid: Le32::new(self.uid),
            i_gid: Le32::new(self.gid),
            i_size: Le32::new(self.size),
            i_ctime: Le32::new(self.ctime),
            i_atime: Le32::new(self.atime),
            i_mtime: Le32::new(self.mtime),
            i_blocks: Le32::new(self.blocks),
            i_nlink: Le32::new(self.nlink),
            ei_block: Le32::new(self.ei_block),
            i_data: self.data,
        }
    }
}

/// Fixed slot table of inode records starting right after the superblock.
/// Inode `n` lives in slot `n % INODES_PER_BLOCK` of store block
/// `1 + n / INODES_PER_BLOCK`, so there is nothing to search.
#[derive(Debug, Clone, Copy)]
pub struct InodeStore {
    first_block: u32,
    nr_inodes: u32,
}

impl InodeStore {
    pub fn new(geo: &Geometry) -> Self {
        Self {
            first_block: geo.istore_start(),
            nr_inodes: geo.nr_inodes,
        }
    }

    /// The store block and byte offset holding inode `ino`.
    pub fn locate(&self, ino: u32) -> Result<(u32, usize), SFSError> {
        if ino >= self.nr_inodes {
            return Err(SFSError::OutOfRange(ino));
        }
        let block = self.first_block + ino / INODES_PER_BLOCK;
        let offset = (ino % INODES_PER_BLOCK) as usize * INODE_SIZE;
        Ok((block, offset))
    }

    pub fn get<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<Inode, SFSError> {
        let (block, offset) = self.locate(ino)?;
        let buf = BlockBuffer::read(dev, block)?;
        let raw = RawInode::read_from(&buf.data()[offset..offset + INODE_SIZE]).ok_or_else(
            || SFSError::CorruptMetadata(format!("inode {} record is truncated", ino)),
        )?;
        Ok(Inode::decode(&raw))
    }

    /// Writes the record back through the store block it shares with its
    /// neighbours, flushing it before returning.
    pub fn put<T: BlockStorage>(
        &self,
        dev: &mut T,
        ino: u32,
        inode: &Inode,
    ) -> Result<(), SFSError> {
        let (block, offset) = self.locate(ino)?;
        let mut buf = BlockBuffer::read(dev, block)?;
        inode
            .encode()
            .write_to(&mut buf.data_mut()[offset..offset + INODE_SIZE])
            .ok_or_else(|| SFSError::CorruptMetadata(format!("inode {} slot is truncated", ino)))?;
        buf.mark_dirty();
        buf.flush(dev)?;
        debug!("wrote inode {} to block {} offset {}", ino, block, offset);
        Ok(())
    }
}
