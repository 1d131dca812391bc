use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::{Bitmap, State};
use crate::dir::{check_name, DirEntry, DirectoryBlock};
use crate::extent::{Extent, ExtentIndex};
use crate::io::{BlockBuffer, BlockStorage};
use crate::layout::{
    Geometry, BLOCK_SIZE, FILENAME_LEN, INODE_DATA_LEN, ROOT_INO, SB_MAGIC, SUPERBLOCK_INDEX,
};
use crate::node::{Inode, InodeStore, ROOT_DEFAULT_MODE, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::sb::SuperBlock;

use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SFSError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("block I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no space left on device")]
    OutOfSpace,
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),
    #[error("found no entry with that name")]
    NotFound,
    #[error("logical block {logical} of inode {ino} is not mapped")]
    Hole { ino: u32, logical: u32 },
    #[error("extent index is full")]
    IndexFull,
    #[error("directory is full")]
    DirectoryFull,
    #[error("name of {0} bytes is too long")]
    NameTooLong(usize),
    #[error("device of {blocks} blocks is too small, need at least {min}")]
    DeviceTooSmall { blocks: u32, min: u32 },
    #[error("unit {0} freed while already free")]
    DoubleFree(u32),
    #[error("index {0} is outside the allocatable range")]
    InvalidIndex(u32),
    #[error("inode {0} is out of range")]
    OutOfRange(u32),
    #[error("an entry with that name already exists")]
    AlreadyExists,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
}

/// File system wide usage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub f_type: u32,
    pub f_bsize: u32,
    pub f_blocks: u32,
    pub f_bfree: u32,
    pub f_bavail: u32,
    /// Inodes in use.
    pub f_files: u32,
    pub f_ffree: u32,
    pub f_namelen: u32,
}

/// The hooks a host mount layer calls into. This is the only dynamic
/// boundary of the file system.
pub trait SuperOperations {
    /// Reserves an inode number. The record is written by the caller.
    fn alloc_inode(&self) -> Result<u32, SFSError>;
    /// Releases every block owned by the inode, clears its record and returns
    /// the number to the free pool.
    fn destroy_inode(&self, ino: u32) -> Result<(), SFSError>;
    fn write_inode(&self, ino: u32, inode: &Inode) -> Result<(), SFSError>;
    /// Writes the superblock and both bitmaps in full. With `wait` the device
    /// is synced before returning.
    fn sync_fs(&self, wait: bool) -> Result<(), SFSError>;
    fn stat(&self) -> StatFs;
}

/// Both bitmaps and their free counters. Guarded by a single lock so a bit and
/// its counter are never observed out of step.
struct Allocators {
    inodes: Bitmap,
    blocks: Bitmap,
}

fn lock<U>(m: &Mutex<U>) -> MutexGuard<'_, U> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A mounted file system.
///
/// Locks are always taken in the order: per-inode lock (parent directory
/// before child), allocation lock, device lock.
pub struct SFS<T: BlockStorage> {
    dev: Mutex<T>,
    geo: Geometry,
    store: InodeStore,
    alloc: Mutex<Allocators>,
    inode_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl<T: BlockStorage> SFS<T> {
    /// Formats the device and returns the mounted result.
    ///
    /// # Layout
    /// ==========================================================================
    /// | SuperBlock | Inode store | Bitmap (inodes) | Bitmap (blocks) | Data    |
    /// ==========================================================================
    ///
    /// The data region is not written. The root directory's entry block is the
    /// first data block and holds whatever the device held before.
    pub fn format(mut dev: T) -> Result<Self, SFSError> {
        let geo = Geometry::compute(dev.block_count())?;
        let super_block = SuperBlock::new(&geo);
        dev.write_block(SUPERBLOCK_INDEX, &super_block.serialize())?;

        let store = InodeStore::new(&geo);
        for i in 0..geo.nr_istore_blocks {
            BlockBuffer::zeroed(geo.istore_start() + i).flush(&mut dev)?;
        }
        let root = Inode {
            mode: ROOT_DEFAULT_MODE,
            size: BLOCK_SIZE as u32,
            blocks: 1,
            nlink: 2,
            ei_block: geo.first_data_block(),
            ..Inode::default()
        };
        store.put(&mut dev, ROOT_INO, &root)?;

        let inodes = Bitmap::formatted(geo.nr_ifree_blocks, ROOT_INO + 1, geo.nr_inodes);
        let blocks = Bitmap::formatted(
            geo.nr_bfree_blocks,
            geo.first_data_block() + 1,
            geo.nr_blocks,
        );
        write_bitmap(&mut dev, geo.ifree_start(), &inodes)?;
        write_bitmap(&mut dev, geo.bfree_start(), &blocks)?;
        dev.sync_disk()?;

        info!(
            "formatted {} blocks: {} inodes ({} istore blocks), {} ifree, {} bfree, {} data blocks",
            geo.nr_blocks,
            geo.nr_inodes,
            geo.nr_istore_blocks,
            geo.nr_ifree_blocks,
            geo.nr_bfree_blocks,
            geo.nr_data_blocks
        );
        Ok(Self::assemble(dev, geo, inodes, blocks))
    }

    /// Mounts an already formatted device.
    ///
    /// # Errors
    ///
    /// Any disagreement between the superblock, the device size and the
    /// bitmaps is `CorruptMetadata`; the file system does not come up.
    pub fn open(mut dev: T) -> Result<Self, SFSError> {
        let mut block_buf = vec![0; BLOCK_SIZE];

        dev.read_block(SUPERBLOCK_INDEX, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf)?;
        let geo = super_block.geometry()?;
        if geo.nr_blocks > dev.block_count() {
            return Err(SFSError::CorruptMetadata(format!(
                "superblock describes {} blocks but the device has {}",
                geo.nr_blocks,
                dev.block_count()
            )));
        }

        let raw = read_region(&mut dev, geo.ifree_start(), geo.nr_ifree_blocks)?;
        let inodes = Bitmap::parse(&raw, ROOT_INO + 1, geo.nr_inodes)?;
        let raw = read_region(&mut dev, geo.bfree_start(), geo.nr_bfree_blocks)?;
        let blocks = Bitmap::parse(&raw, geo.first_data_block() + 1, geo.nr_blocks)?;

        if inodes.free_count() != super_block.nr_free_inodes
            || blocks.free_count() != super_block.nr_free_blocks
        {
            warn!(
                "bitmaps count {} free inodes and {} free blocks, superblock says {} and {}",
                inodes.free_count(),
                blocks.free_count(),
                super_block.nr_free_inodes,
                super_block.nr_free_blocks
            );
            return Err(SFSError::CorruptMetadata(
                "free counters disagree with bitmaps".to_string(),
            ));
        }

        let root = InodeStore::new(&geo).get(&mut dev, ROOT_INO)?;
        if !root.is_dir() || root.ei_block != geo.first_data_block() {
            return Err(SFSError::CorruptMetadata(
                "root inode is not the formatted directory".to_string(),
            ));
        }

        info!(
            "mounted {} blocks, {} free blocks, {} free inodes",
            geo.nr_blocks,
            blocks.free_count(),
            inodes.free_count()
        );
        Ok(Self::assemble(dev, geo, inodes, blocks))
    }

    fn assemble(dev: T, geo: Geometry, inodes: Bitmap, blocks: Bitmap) -> Self {
        Self {
            dev: Mutex::new(dev),
            store: InodeStore::new(&geo),
            geo,
            alloc: Mutex::new(Allocators { inodes, blocks }),
            inode_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Flushes all metadata and hands the device back.
    pub fn unmount(self) -> Result<T, SFSError> {
        self.sync_fs(true)?;
        info!("unmounted");
        Ok(self.dev.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// The superblock as it would be written by the next sync.
    pub fn superblock(&self) -> SuperBlock {
        let alloc = lock(&self.alloc);
        SuperBlock {
            nr_free_inodes: alloc.inodes.free_count(),
            nr_free_blocks: alloc.blocks.free_count(),
            ..SuperBlock::new(&self.geo)
        }
    }

    /// The lock serializing changes to `ino`. Numbers outside the store get
    /// no entry.
    fn inode_lock(&self, ino: u32) -> Result<Arc<Mutex<()>>, SFSError> {
        self.store.locate(ino)?;
        Ok(lock(&self.inode_locks)
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    pub fn read_inode(&self, ino: u32) -> Result<Inode, SFSError> {
        self.store.get(&mut *lock(&self.dev), ino)
    }

    /// Reads the record of the regular file `ino`. Free slots and other file
    /// types have no extents.
    fn read_file(&self, ino: u32) -> Result<Inode, SFSError> {
        let inode = self.read_inode(ino)?;
        let allocated = lock(&self.alloc).inodes.get(ino) == State::Used;
        if !allocated || inode.is_empty() {
            return Err(SFSError::InvalidArgument(format!(
                "inode {} is not allocated",
                ino
            )));
        }
        if inode.mode & S_IFMT != S_IFREG {
            return Err(SFSError::InvalidArgument(format!(
                "inode {} is not a regular file",
                ino
            )));
        }
        Ok(inode)
    }

    fn read_block(&self, blocknr: u32) -> Result<BlockBuffer, SFSError> {
        Ok(BlockBuffer::read(&mut *lock(&self.dev), blocknr)?)
    }

    fn write_block(&self, blocknr: u32, data: &[u8]) -> Result<(), SFSError> {
        let mut buf = BlockBuffer::zeroed(blocknr);
        buf.data_mut().copy_from_slice(data);
        buf.flush(&mut *lock(&self.dev))?;
        Ok(())
    }

    fn free_blocks(&self, runs: &[(u32, u32)]) -> Result<(), SFSError> {
        let mut alloc = lock(&self.alloc);
        for &(start, len) in runs {
            alloc.blocks.free_run(start, len)?;
        }
        Ok(())
    }

    /// Gives back blocks taken by a failed operation.
    fn roll_back(&self, runs: &[(u32, u32)]) {
        if let Err(e) = self.free_blocks(runs) {
            warn!("rollback of {:?} failed: {}", runs, e);
        }
    }

    fn load_index(&self, inode: &Inode) -> Result<ExtentIndex, SFSError> {
        if inode.ei_block == 0 {
            return Ok(ExtentIndex::new());
        }
        self.check_data_block(inode.ei_block)?;
        ExtentIndex::parse(self.read_block(inode.ei_block)?.data())
    }

    fn check_data_block(&self, blocknr: u32) -> Result<(), SFSError> {
        if blocknr < self.geo.first_data_block() || blocknr >= self.geo.nr_blocks {
            return Err(SFSError::CorruptMetadata(format!(
                "block {} is outside the data region",
                blocknr
            )));
        }
        Ok(())
    }

    fn load_dir(&self, ino: u32) -> Result<(Inode, DirectoryBlock), SFSError> {
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(SFSError::InvalidArgument(format!(
                "inode {} is not a directory",
                ino
            )));
        }
        self.check_data_block(inode.ei_block)?;
        let entries = DirectoryBlock::parse(self.read_block(inode.ei_block)?.data())?;
        Ok((inode, entries))
    }

    /// Frees what `inode` owns, clears the record and frees the number. The
    /// caller holds the inode lock.
    fn release_inode(&self, ino: u32, inode: &Inode) -> Result<(), SFSError> {
        if ino == ROOT_INO {
            return Err(SFSError::InvalidIndex(ino));
        }
        let mut runs = Vec::new();
        if inode.is_dir() {
            self.check_data_block(inode.ei_block)?;
            runs.push((inode.ei_block, 1));
        } else if inode.ei_block != 0 {
            let index = self.load_index(inode)?;
            runs.extend(index.extents().iter().map(|e| (e.ee_start, e.ee_len)));
            runs.push((inode.ei_block, 1));
        }

        self.store.put(&mut *lock(&self.dev), ino, &Inode::default())?;
        let mut alloc = lock(&self.alloc);
        for &(start, len) in &runs {
            alloc.blocks.free_run(start, len)?;
        }
        alloc.inodes.free(ino)?;
        debug!("destroyed inode {}, released {:?}", ino, runs);
        Ok(())
    }

    /// Physical block holding logical block `logical` of file `ino`.
    ///
    /// # Errors
    ///
    /// `Hole` if no extent covers the position.
    pub fn resolve(&self, ino: u32, logical: u32) -> Result<u32, SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);

        let inode = self.read_file(ino)?;
        self.load_index(&inode)?
            .resolve(logical)
            .ok_or(SFSError::Hole { ino, logical })
    }

    /// The extents of file `ino` in logical order.
    pub fn extents(&self, ino: u32) -> Result<Vec<Extent>, SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);

        let inode = self.read_file(ino)?;
        Ok(self.load_index(&inode)?.extents().to_vec())
    }

    /// Maps `len` new blocks at `logical_start` of file `ino` and returns the
    /// first physical block. The run is allocated as one contiguous piece.
    /// The index block is allocated on the first call.
    ///
    /// # Errors
    ///
    /// `OutOfSpace` when no contiguous run is free, `IndexFull` when the run
    /// can't be merged and the index has no room. Nothing stays allocated on
    /// failure.
    pub fn append(&self, ino: u32, logical_start: u32, len: u32) -> Result<u32, SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);

        let mut inode = self.read_file(ino)?;
        let mut index = self.load_index(&inode)?;
        index.check_free_range(logical_start, len)?;

        let mut taken = Vec::with_capacity(2);
        let (index_block, start) = {
            let mut alloc = lock(&self.alloc);
            let index_block = if inode.ei_block == 0 {
                let b = alloc.blocks.allocate()?;
                taken.push((b, 1));
                b
            } else {
                inode.ei_block
            };
            match alloc.blocks.allocate_run(len) {
                Ok(start) => {
                    taken.push((start, len));
                    (index_block, start)
                }
                Err(e) => {
                    drop(alloc);
                    self.roll_back(&taken);
                    return Err(e);
                }
            }
        };

        let extent = Extent {
            ee_block: logical_start,
            ee_len: len,
            ee_start: start,
        };
        let result = index.insert(extent).and_then(|merged| {
            self.write_block(index_block, &index.serialize())?;
            inode.ei_block = index_block;
            inode.blocks = index.mapped_blocks();
            inode.mtime = now();
            self.store.put(&mut *lock(&self.dev), ino, &inode)?;
            Ok(merged)
        });

        match result {
            Ok(merged) => {
                debug!(
                    "inode {}: mapped {}+{} at {} ({}, {} extents)",
                    ino,
                    logical_start,
                    len,
                    start,
                    if merged { "merged" } else { "new record" },
                    index.len()
                );
                Ok(start)
            }
            Err(e) => {
                self.roll_back(&taken);
                Err(e)
            }
        }
    }

    /// Cuts file `ino` down to its first `new_block_count` logical blocks.
    /// Truncating to zero releases the index block too.
    pub fn truncate(&self, ino: u32, new_block_count: u32) -> Result<(), SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);

        let mut inode = self.read_file(ino)?;
        if inode.ei_block == 0 {
            return Ok(());
        }

        let mut index = self.load_index(&inode)?;
        let mut released = index.truncate(new_block_count);
        if released.is_empty() && !index.is_empty() {
            return Ok(());
        }

        if index.is_empty() {
            released.push((inode.ei_block, 1));
            inode.ei_block = 0;
        } else {
            self.write_block(inode.ei_block, &index.serialize())?;
        }
        inode.blocks = index.mapped_blocks();
        let max_size = new_block_count.saturating_mul(BLOCK_SIZE as u32);
        if inode.size > max_size {
            inode.size = max_size;
        }
        inode.mtime = now();
        self.store.put(&mut *lock(&self.dev), ino, &inode)?;

        self.free_blocks(&released)?;
        debug!(
            "inode {}: truncated to {} blocks, released {:?}",
            ino, new_block_count, released
        );
        Ok(())
    }

    pub fn lookup(&self, dir: u32, name: &[u8]) -> Result<u32, SFSError> {
        let inode_lock = self.inode_lock(dir)?;
        let _guard = lock(&inode_lock);
        self.load_dir(dir)?.1.lookup(name)
    }

    pub fn readdir(&self, dir: u32) -> Result<Vec<DirEntry>, SFSError> {
        let inode_lock = self.inode_lock(dir)?;
        let _guard = lock(&inode_lock);
        Ok(self.load_dir(dir)?.1.iter().copied().collect())
    }

    /// Creates a regular file or a directory named `name` in `dir`. A new
    /// directory gets its own zeroed entry block.
    pub fn create(
        &self,
        dir: u32,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<u32, SFSError> {
        let is_dir = match mode & S_IFMT {
            S_IFDIR => true,
            S_IFREG => false,
            _ => {
                return Err(SFSError::InvalidArgument(format!(
                    "unsupported file mode {:o}",
                    mode
                )))
            }
        };
        let t = now();
        let inode = Inode {
            mode,
            uid,
            gid,
            ctime: t,
            atime: t,
            mtime: t,
            nlink: if is_dir { 2 } else { 1 },
            ..Inode::default()
        };
        self.add_node(dir, name, inode)
    }

    /// Creates a symbolic link whose target is stored inline in the inode.
    pub fn symlink(
        &self,
        dir: u32,
        name: &[u8],
        target: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<u32, SFSError> {
        if target.is_empty() {
            return Err(SFSError::InvalidArgument(
                "symlink target is empty".to_string(),
            ));
        }
        if target.len() > INODE_DATA_LEN {
            return Err(SFSError::NameTooLong(target.len()));
        }
        let t = now();
        let mut inode = Inode {
            mode: S_IFLNK | 0o777,
            uid,
            gid,
            size: target.len() as u32,
            ctime: t,
            atime: t,
            mtime: t,
            nlink: 1,
            ..Inode::default()
        };
        inode.data[..target.len()].copy_from_slice(target);
        self.add_node(dir, name, inode)
    }

    pub fn readlink(&self, ino: u32) -> Result<Vec<u8>, SFSError> {
        let inode = self.read_inode(ino)?;
        if !inode.is_symlink() {
            return Err(SFSError::InvalidArgument(format!(
                "inode {} is not a symlink",
                ino
            )));
        }
        let len = std::cmp::min(inode.size as usize, INODE_DATA_LEN);
        Ok(inode.data[..len].to_vec())
    }

    fn add_node(&self, dir: u32, name: &[u8], mut inode: Inode) -> Result<u32, SFSError> {
        let inode_lock = self.inode_lock(dir)?;
        let _guard = lock(&inode_lock);

        check_name(name)?;
        let (mut parent, mut entries) = self.load_dir(dir)?;
        if entries.lookup(name).is_ok() {
            return Err(SFSError::AlreadyExists);
        }

        let (ino, entry_block) = {
            let mut alloc = lock(&self.alloc);
            let ino = alloc.inodes.allocate()?;
            let entry_block = if inode.is_dir() {
                match alloc.blocks.allocate() {
                    Ok(b) => Some(b),
                    Err(e) => {
                        alloc.inodes.free(ino)?;
                        return Err(e);
                    }
                }
            } else {
                None
            };
            (ino, entry_block)
        };

        let result = entries.insert(name, ino).and_then(|()| {
            if let Some(b) = entry_block {
                self.write_block(b, &DirectoryBlock::new().serialize())?;
                inode.ei_block = b;
                inode.blocks = 1;
                inode.size = BLOCK_SIZE as u32;
                parent.nlink += 1;
            }
            self.store.put(&mut *lock(&self.dev), ino, &inode)?;
            self.write_block(parent.ei_block, &entries.serialize())?;
            parent.mtime = inode.mtime;
            self.store.put(&mut *lock(&self.dev), dir, &parent)?;
            Ok(())
        });

        if let Err(e) = result {
            let mut alloc = lock(&self.alloc);
            if let Some(b) = entry_block {
                alloc.blocks.free(b)?;
            }
            alloc.inodes.free(ino)?;
            return Err(e);
        }
        debug!(
            "created inode {} as {:?} in directory {}",
            ino,
            String::from_utf8_lossy(name),
            dir
        );
        Ok(ino)
    }

    /// Adds another name for the non-directory `ino`.
    pub fn link(&self, dir: u32, name: &[u8], ino: u32) -> Result<(), SFSError> {
        check_name(name)?;
        let not_linkable = || SFSError::InvalidArgument(format!("inode {} can't be linked", ino));
        // A child lock is only taken under its parent's. Directories are
        // turned away before locking.
        let unlocked = self.read_inode(ino)?;
        if unlocked.is_empty() || unlocked.is_dir() {
            return Err(not_linkable());
        }

        let dir_lock = self.inode_lock(dir)?;
        let _dir_guard = lock(&dir_lock);
        let (parent, mut entries) = self.load_dir(dir)?;

        let child_lock = self.inode_lock(ino)?;
        let _child_guard = lock(&child_lock);
        let mut inode = self.read_inode(ino)?;
        if inode.is_empty() || inode.is_dir() {
            return Err(not_linkable());
        }

        entries.insert(name, ino)?;
        inode.nlink += 1;
        inode.ctime = now();
        self.store.put(&mut *lock(&self.dev), ino, &inode)?;
        self.write_block(parent.ei_block, &entries.serialize())?;
        Ok(())
    }

    /// Removes `name` from `dir`. The inode is destroyed once its last link is
    /// gone; directories must be empty.
    pub fn unlink(&self, dir: u32, name: &[u8]) -> Result<(), SFSError> {
        let dir_lock = self.inode_lock(dir)?;
        let _dir_guard = lock(&dir_lock);
        let (mut parent, mut entries) = self.load_dir(dir)?;
        let ino = entries.lookup(name)?;
        if ino == dir {
            return Err(SFSError::CorruptMetadata(format!(
                "directory {} lists itself",
                dir
            )));
        }

        let child_lock = self.inode_lock(ino)?;
        let _child_guard = lock(&child_lock);
        let mut inode = self.read_inode(ino)?;
        if inode.is_dir() {
            let (_, children) = self.load_dir(ino)?;
            if !children.is_empty() {
                return Err(SFSError::DirectoryNotEmpty);
            }
        }

        entries.remove(name)?;
        self.write_block(parent.ei_block, &entries.serialize())?;
        if inode.is_dir() {
            parent.nlink -= 1;
        }
        parent.mtime = now();
        self.store.put(&mut *lock(&self.dev), dir, &parent)?;

        inode.nlink = inode.nlink.saturating_sub(1);
        if inode.is_dir() || inode.nlink == 0 {
            self.release_inode(ino, &inode)?;
        } else {
            inode.ctime = parent.mtime;
            self.store.put(&mut *lock(&self.dev), ino, &inode)?;
        }
        debug!(
            "unlinked {:?} (inode {}) from directory {}",
            String::from_utf8_lossy(name),
            ino,
            dir
        );
        Ok(())
    }
}

impl<T: BlockStorage> SuperOperations for SFS<T> {
    fn alloc_inode(&self) -> Result<u32, SFSError> {
        lock(&self.alloc).inodes.allocate()
    }

    fn destroy_inode(&self, ino: u32) -> Result<(), SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);
        let inode = self.read_inode(ino)?;
        self.release_inode(ino, &inode)
    }

    fn write_inode(&self, ino: u32, inode: &Inode) -> Result<(), SFSError> {
        let inode_lock = self.inode_lock(ino)?;
        let _guard = lock(&inode_lock);
        self.store.put(&mut *lock(&self.dev), ino, inode)
    }

    fn sync_fs(&self, wait: bool) -> Result<(), SFSError> {
        let alloc = lock(&self.alloc);
        let super_block = SuperBlock {
            nr_free_inodes: alloc.inodes.free_count(),
            nr_free_blocks: alloc.blocks.free_count(),
            ..SuperBlock::new(&self.geo)
        };

        let mut dev = lock(&self.dev);
        let mut buf = BlockBuffer::zeroed(SUPERBLOCK_INDEX);
        buf.data_mut().copy_from_slice(&super_block.serialize());
        buf.flush(&mut *dev)?;
        write_bitmap(&mut *dev, self.geo.ifree_start(), &alloc.inodes)?;
        write_bitmap(&mut *dev, self.geo.bfree_start(), &alloc.blocks)?;
        if wait {
            dev.sync_disk()?;
        }
        debug!(
            "synced superblock: {} free inodes, {} free blocks",
            super_block.nr_free_inodes, super_block.nr_free_blocks
        );
        Ok(())
    }

    fn stat(&self) -> StatFs {
        let alloc = lock(&self.alloc);
        StatFs {
            f_type: SB_MAGIC,
            f_bsize: BLOCK_SIZE as u32,
            f_blocks: self.geo.nr_blocks,
            f_bfree: alloc.blocks.free_count(),
            f_bavail: alloc.blocks.free_count(),
            f_files: self.geo.nr_inodes - alloc.inodes.free_count(),
            f_ffree: alloc.inodes.free_count(),
            f_namelen: FILENAME_LEN as u32,
        }
    }
}

fn write_bitmap<T: BlockStorage>(dev: &mut T, first: u32, bitmap: &Bitmap) -> Result<(), SFSError> {
    for (i, chunk) in bitmap.serialize().chunks(BLOCK_SIZE).enumerate() {
        let mut buf = BlockBuffer::zeroed(first + i as u32);
        buf.data_mut().copy_from_slice(chunk);
        buf.flush(dev)?;
    }
    Ok(())
}

fn read_region<T: BlockStorage>(dev: &mut T, first: u32, count: u32) -> Result<Vec<u8>, SFSError> {
    let mut raw = Vec::with_capacity(count as usize * BLOCK_SIZE);
    for i in 0..count {
        raw.extend_from_slice(BlockBuffer::read(dev, first + i)?.data());
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileBlockEmulator, FileBlockEmulatorBuilder};
    use crate::layout::{BITS_PER_BLOCK, MAX_EXTENTS};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn create_test_device(blocks: u32) -> FileBlockEmulator {
        let dev = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(dev)
            .with_block_size(blocks)
            .build()
            .expect("Could not initialize disk emulator.")
    }

    fn create_fs() -> SFS<FileBlockEmulator> {
        SFS::format(create_test_device(1024)).unwrap()
    }

    fn new_file(fs: &SFS<FileBlockEmulator>, name: &str) -> u32 {
        fs.create(ROOT_INO, name.as_bytes(), S_IFREG | 0o644, 0, 0)
            .unwrap()
    }

    #[test]
    fn root_inode_is_formatted_directory() {
        let fs = create_fs();
        let root = fs.read_inode(ROOT_INO).unwrap();

        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
        assert_eq!(root.size, BLOCK_SIZE as u32);
        assert_eq!(root.blocks, 1);
        assert_eq!(root.ei_block, fs.geometry().first_data_block());
        assert!(fs.readdir(ROOT_INO).unwrap().is_empty());
    }

    #[test]
    fn format_leaves_only_root_allocated() {
        let fs = create_fs();
        let geo = fs.geometry();
        let stat = fs.stat();

        assert_eq!(stat.f_ffree, geo.nr_inodes - 1);
        assert_eq!(stat.f_files, 1);
        assert_eq!(stat.f_bfree, geo.nr_data_blocks - 1);
        assert_eq!(stat.f_namelen, FILENAME_LEN as u32);
        assert_eq!(fs.alloc_inode().unwrap(), 1);
    }

    #[test]
    fn file_not_found_returns_error() {
        let fs = create_fs();
        assert!(matches!(
            fs.lookup(ROOT_INO, b"foo"),
            Err(SFSError::NotFound)
        ));
    }

    #[test]
    fn created_files_can_be_looked_up() {
        let fs = create_fs();
        let ino = new_file(&fs, "foo");

        assert_eq!(ino, 1);
        assert_eq!(fs.lookup(ROOT_INO, b"foo").unwrap(), ino);
        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.ei_block, 0);
        assert!(matches!(
            fs.create(ROOT_INO, b"foo", S_IFREG | 0o644, 0, 0),
            Err(SFSError::AlreadyExists)
        ));
    }

    #[test]
    fn append_allocates_index_then_data() {
        let fs = create_fs();
        let ino = new_file(&fs, "data");
        let first = fs.geometry().first_data_block();

        let start = fs.append(ino, 0, 4).unwrap();

        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.ei_block, first + 1);
        assert_eq!(start, first + 2);
        assert_eq!(inode.blocks, 4);
        for l in 0..4 {
            assert_eq!(fs.resolve(ino, l).unwrap(), start + l);
        }
        assert!(matches!(
            fs.resolve(ino, 4),
            Err(SFSError::Hole { logical: 4, .. })
        ));
    }

    #[test]
    fn contiguous_appends_merge() {
        let fs = create_fs();
        let ino = new_file(&fs, "grow");

        let a = fs.append(ino, 0, 2).unwrap();
        let b = fs.append(ino, 2, 3).unwrap();

        assert_eq!(b, a + 2);
        let extents = fs.extents(ino).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].ee_len, 5);
        assert_eq!(fs.read_inode(ino).unwrap().blocks, 5);
    }

    #[test]
    fn interleaved_files_get_separate_extents() {
        let fs = create_fs();
        let x = new_file(&fs, "x");
        let y = new_file(&fs, "y");

        fs.append(x, 0, 1).unwrap();
        fs.append(y, 0, 1).unwrap();
        fs.append(x, 1, 1).unwrap();

        assert_eq!(fs.extents(x).unwrap().len(), 2);
        assert_eq!(fs.extents(y).unwrap().len(), 1);
    }

    #[test]
    fn index_full_rolls_back_allocation() {
        let fs = SFS::format(create_test_device(2048)).unwrap();
        let ino = new_file(&fs, "fragmented");
        for i in 0..MAX_EXTENTS as u32 {
            fs.append(ino, i * 2, 1).unwrap();
        }
        let extents = fs.extents(ino).unwrap();
        let free_before = fs.stat().f_bfree;
        let sb_before = fs.superblock();
        let bitmap_before = lock(&fs.alloc).blocks.serialize();

        assert!(matches!(
            fs.append(ino, MAX_EXTENTS as u32 * 2 + 1, 1),
            Err(SFSError::IndexFull)
        ));

        assert_eq!(fs.extents(ino).unwrap(), extents);
        assert_eq!(fs.stat().f_bfree, free_before);
        assert_eq!(fs.superblock(), sb_before);
        assert_eq!(lock(&fs.alloc).blocks.serialize(), bitmap_before);
    }

    #[test]
    fn out_of_space_rolls_back_index_block() {
        let fs = SFS::format(create_test_device(128)).unwrap();
        let ino = new_file(&fs, "big");
        let free_before = fs.stat().f_bfree;
        let bitmap_before = lock(&fs.alloc).blocks.serialize();

        assert!(matches!(
            fs.append(ino, 0, free_before),
            Err(SFSError::OutOfSpace)
        ));
        assert_eq!(fs.stat().f_bfree, free_before);
        assert_eq!(lock(&fs.alloc).blocks.serialize(), bitmap_before);
        assert_eq!(fs.read_inode(ino).unwrap().ei_block, 0);

        // One block goes to the index, the rest fits.
        fs.append(ino, 0, free_before - 1).unwrap();
        assert_eq!(fs.stat().f_bfree, 0);
    }

    #[test]
    fn overlapping_append_is_rejected_without_allocating() {
        let fs = create_fs();
        let ino = new_file(&fs, "f");
        fs.append(ino, 0, 4).unwrap();
        let free_before = fs.stat().f_bfree;

        assert!(matches!(
            fs.append(ino, 2, 4),
            Err(SFSError::InvalidArgument(_))
        ));
        assert_eq!(fs.stat().f_bfree, free_before);
    }

    #[test]
    fn truncate_releases_tail_and_index() {
        let fs = create_fs();
        let ino = new_file(&fs, "t");
        let free_start = fs.stat().f_bfree;
        fs.append(ino, 0, 4).unwrap();
        fs.append(ino, 10, 4).unwrap();

        fs.truncate(ino, 2).unwrap();
        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.blocks, 2);
        assert_eq!(fs.stat().f_bfree, free_start - 3);
        assert!(fs.resolve(ino, 2).is_err());

        // Already short enough.
        fs.truncate(ino, 5).unwrap();
        assert_eq!(fs.stat().f_bfree, free_start - 3);

        fs.truncate(ino, 0).unwrap();
        assert_eq!(fs.read_inode(ino).unwrap().ei_block, 0);
        assert_eq!(fs.stat().f_bfree, free_start);
        fs.truncate(ino, 0).unwrap();
    }

    #[test]
    fn directories_reject_extent_operations() {
        let fs = create_fs();
        assert!(fs.append(ROOT_INO, 0, 1).is_err());
        assert!(fs.resolve(ROOT_INO, 0).is_err());
        assert!(fs.truncate(ROOT_INO, 0).is_err());
    }

    #[test]
    fn mkdir_and_rmdir_track_links_and_blocks() {
        let fs = create_fs();
        let free_blocks = fs.stat().f_bfree;
        let sub = fs.create(ROOT_INO, b"sub", S_IFDIR | 0o755, 0, 0).unwrap();

        assert_eq!(fs.read_inode(ROOT_INO).unwrap().nlink, 3);
        assert_eq!(fs.read_inode(sub).unwrap().nlink, 2);
        assert_eq!(fs.stat().f_bfree, free_blocks - 1);

        let inner = fs.create(sub, b"inner", S_IFREG | 0o600, 1, 1).unwrap();
        assert!(matches!(
            fs.unlink(ROOT_INO, b"sub"),
            Err(SFSError::DirectoryNotEmpty)
        ));

        fs.unlink(sub, b"inner").unwrap();
        fs.unlink(ROOT_INO, b"sub").unwrap();
        assert_eq!(fs.read_inode(ROOT_INO).unwrap().nlink, 2);
        assert_eq!(fs.stat().f_bfree, free_blocks);
        assert!(fs.read_inode(inner).unwrap().is_empty());
        assert!(fs.read_inode(sub).unwrap().is_empty());
    }

    #[test]
    fn hard_links_keep_inode_until_last_unlink() {
        let fs = create_fs();
        let ino = new_file(&fs, "a");
        fs.append(ino, 0, 3).unwrap();
        fs.link(ROOT_INO, b"b", ino).unwrap();
        let free_blocks = fs.stat().f_bfree;

        fs.unlink(ROOT_INO, b"a").unwrap();
        assert_eq!(fs.read_inode(ino).unwrap().nlink, 1);
        assert_eq!(fs.lookup(ROOT_INO, b"b").unwrap(), ino);

        fs.unlink(ROOT_INO, b"b").unwrap();
        assert!(fs.read_inode(ino).unwrap().is_empty());
        // Three data blocks and the index block.
        assert_eq!(fs.stat().f_bfree, free_blocks + 4);
        assert_eq!(fs.alloc_inode().unwrap(), ino);
    }

    #[test]
    fn symlink_targets_live_in_the_inode() {
        let fs = create_fs();
        let ino = fs.symlink(ROOT_INO, b"ln", b"/some/target", 0, 0).unwrap();

        assert_eq!(fs.readlink(ino).unwrap(), b"/some/target".to_vec());
        assert_eq!(fs.read_inode(ino).unwrap().ei_block, 0);
        assert!(matches!(
            fs.symlink(ROOT_INO, b"long", &[b'x'; 33], 0, 0),
            Err(SFSError::NameTooLong(33))
        ));
        assert!(fs.readlink(ROOT_INO).is_err());
    }

    #[test]
    fn root_can_not_be_destroyed() {
        let fs = create_fs();
        assert!(matches!(
            fs.destroy_inode(ROOT_INO),
            Err(SFSError::InvalidIndex(0))
        ));
    }

    #[test]
    fn sync_persists_counters_and_bitmaps() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_size(512)
            .build()
            .unwrap();
        let fs = SFS::format(dev).unwrap();
        let ino = new_file(&fs, "kept");
        fs.append(ino, 0, 7).unwrap();
        let expected = fs.superblock();
        fs.unmount().unwrap();

        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_size(512)
            .clear_medium(false)
            .build()
            .unwrap();
        let fs = SFS::open(dev).unwrap();

        assert_eq!(fs.superblock(), expected);
        assert_eq!(fs.lookup(ROOT_INO, b"kept").unwrap(), ino);
        assert_eq!(fs.extents(ino).unwrap()[0].ee_len, 7);
    }

    #[test]
    fn unsynced_counters_are_detected_at_mount() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_size(256)
            .build()
            .unwrap();
        let fs = SFS::format(dev).unwrap();
        fs.alloc_inode().unwrap();
        // Bitmap reaches the disk but the superblock is overwritten with the
        // formatted counters.
        fs.sync_fs(true).unwrap();
        let stale = SuperBlock::new(&fs.geometry());
        let mut dev = fs.dev.into_inner().unwrap();
        dev.write_block(SUPERBLOCK_INDEX, &stale.serialize()).unwrap();

        assert!(matches!(
            SFS::open(dev),
            Err(SFSError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn unformatted_device_fails_to_mount() {
        let dev = create_test_device(256);
        assert!(matches!(
            SFS::open(dev),
            Err(SFSError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn tiny_devices_can_not_be_formatted() {
        let dev = create_test_device(64);
        assert!(matches!(
            SFS::format(dev),
            Err(SFSError::DeviceTooSmall { blocks: 64, .. })
        ));
    }

    #[test]
    fn bitmaps_span_multiple_blocks() {
        let blocks = BITS_PER_BLOCK + 100;
        // Sparse file, reads of untouched blocks return zeroes.
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let dev = FileBlockEmulatorBuilder::from(file)
            .with_block_size(blocks)
            .clear_medium(false)
            .build()
            .unwrap();
        let fs = SFS::format(dev).unwrap();
        let geo = fs.geometry();
        assert_eq!(geo.nr_bfree_blocks, 2);
        assert_eq!(geo.nr_ifree_blocks, 2);
        assert_eq!(fs.stat().f_bfree, geo.nr_data_blocks - 1);
    }

    #[test]
    fn free_inodes_have_no_extents() {
        let fs = create_fs();
        let free_blocks = fs.stat().f_bfree;

        assert!(matches!(
            fs.append(1, 0, 3),
            Err(SFSError::InvalidArgument(_))
        ));
        assert!(fs.resolve(1, 0).is_err());
        assert!(fs.truncate(1, 0).is_err());
        assert!(fs.extents(1).is_err());
        assert_eq!(fs.stat().f_bfree, free_blocks);

        // Reserved but never written is still not a file.
        let reserved = fs.alloc_inode().unwrap();
        assert!(fs.append(reserved, 0, 1).is_err());
        assert_eq!(fs.stat().f_bfree, free_blocks);
    }

    #[test]
    fn reused_inode_numbers_start_without_blocks() {
        let fs = create_fs();
        let free_blocks = fs.stat().f_bfree;
        assert!(fs.append(1, 0, 3).is_err());

        let ino = new_file(&fs, "fresh");
        assert_eq!(ino, 1);
        fs.append(ino, 0, 3).unwrap();
        fs.unlink(ROOT_INO, b"fresh").unwrap();
        assert_eq!(fs.stat().f_bfree, free_blocks);
    }

    #[test]
    fn symlinks_have_no_extents() {
        let fs = create_fs();
        let ino = fs.symlink(ROOT_INO, b"ln", b"target", 0, 0).unwrap();
        assert!(matches!(
            fs.append(ino, 0, 1),
            Err(SFSError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_range_inodes_get_no_lock() {
        let fs = create_fs();

        assert!(matches!(
            fs.resolve(u32::MAX, 0),
            Err(SFSError::OutOfRange(_))
        ));
        assert!(fs.append(u32::MAX, 0, 1).is_err());
        assert!(fs.lookup(u32::MAX, b"x").is_err());
        assert!(lock(&fs.inode_locks).is_empty());
    }

    #[test]
    fn directories_can_not_be_linked() {
        let fs = create_fs();
        let a = fs.create(ROOT_INO, b"a", S_IFDIR | 0o755, 0, 0).unwrap();
        let b = fs.create(ROOT_INO, b"b", S_IFDIR | 0o755, 0, 0).unwrap();

        assert!(matches!(
            fs.link(a, b"x", b),
            Err(SFSError::InvalidArgument(_))
        ));
        assert!(fs.link(a, b"self", a).is_err());
        assert!(fs.readdir(a).unwrap().is_empty());
        assert_eq!(fs.read_inode(b).unwrap().nlink, 2);
    }

    #[test]
    fn crossed_directory_links_do_not_deadlock() {
        let fs = Arc::new(create_fs());
        let a = fs.create(ROOT_INO, b"a", S_IFDIR | 0o755, 0, 0).unwrap();
        let b = fs.create(ROOT_INO, b"b", S_IFDIR | 0o755, 0, 0).unwrap();
        let (done, finished) = mpsc::channel();

        for &(dir, ino) in &[(a, b), (b, a)] {
            let fs = Arc::clone(&fs);
            let done = done.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    assert!(fs.link(dir, b"x", ino).is_err());
                }
                done.send(()).unwrap();
            });
        }
        // Racing an unlink of one of the directories takes the locks in
        // parent then child order.
        {
            let fs = Arc::clone(&fs);
            let done = done.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let c = fs.create(a, b"c", S_IFDIR | 0o755, 0, 0).unwrap();
                    assert!(fs.link(c, b"x", a).is_err());
                    fs.unlink(a, b"c").unwrap();
                }
                done.send(()).unwrap();
            });
        }

        for _ in 0..3 {
            finished
                .recv_timeout(Duration::from_secs(30))
                .expect("link loop did not finish");
        }
    }
}
