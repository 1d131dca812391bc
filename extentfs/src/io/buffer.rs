use crate::io::block::{BlockNumber, BlockStorage};
use crate::layout::BLOCK_SIZE;

/// An in-memory copy of one disk block that remembers whether it has been
/// modified since it was read. Writes are deferred until `flush`.
pub struct BlockBuffer {
    blocknr: BlockNumber,
    data: Vec<u8>,
    dirty: bool,
}

impl BlockBuffer {
    /// Reads `blocknr` from the device.
    pub fn read<T: BlockStorage>(dev: &mut T, blocknr: BlockNumber) -> std::io::Result<Self> {
        let mut data = vec![0; BLOCK_SIZE];
        dev.read_block(blocknr, &mut data)?;
        Ok(Self {
            blocknr,
            data,
            dirty: false,
        })
    }

    /// A zero filled buffer for a block whose old contents don't matter. It
    /// starts dirty so the zeroes reach the disk.
    pub fn zeroed(blocknr: BlockNumber) -> Self {
        Self {
            blocknr,
            data: vec![0; BLOCK_SIZE],
            dirty: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the block contents. Callers must `mark_dirty` for the
    /// change to be written back.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Writes the block back and makes it durable if it was modified. Clean
    /// buffers are left alone.
    pub fn flush<T: BlockStorage>(&mut self, dev: &mut T) -> std::io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        dev.write_block(self.blocknr, &self.data)?;
        dev.flush_block(self.blocknr)?;
        self.dirty = false;
        Ok(())
    }
}
