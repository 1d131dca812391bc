use crate::fs::SFSError;
use crate::layout::BLOCK_SIZE;

use log::{debug, error};

const WORD_BITS: u32 = 64;
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 8;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A free/used tracker spread over one or more contiguous disk blocks. A set
/// bit means free. Each 4K block tracks 4096 * 8 = 32,768 units and the blocks
/// are addressed as one bit space, so index 32,768 is bit 0 of the second block.
///
/// Only indices in `floor..len` are ever handed out or released. Bits below
/// `floor` belong to units reserved at format time (the root inode, the
/// metadata blocks) and bits past `len` pad out the last bitmap block; both
/// stay used for the life of the file system.
///
/// The free counter is kept next to the bits so the two can't drift apart: the
/// allocator always updates both in the same call.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    words: Vec<u64>,
    floor: u32,
    len: u32,
    free: u32,
}

impl Bitmap {
    /// A bitmap spanning `nr_map_blocks` blocks with `floor..len` free.
    pub fn formatted(nr_map_blocks: u32, floor: u32, len: u32) -> Self {
        debug_assert!(floor <= len);
        debug_assert!(len as usize <= nr_map_blocks as usize * WORDS_PER_BLOCK * 64);
        let mut bmp = Self {
            words: vec![0; nr_map_blocks as usize * WORDS_PER_BLOCK],
            floor,
            len,
            free: 0,
        };
        for i in floor..len {
            bmp.set_free(i);
        }
        bmp.free = len - floor;
        bmp
    }

    /// Loads a bitmap from its raw on-disk blocks, recounting the free units.
    ///
    /// # Errors
    ///
    /// A reserved unit marked free means the bitmap was not written by the
    /// formatter and is reported as `CorruptMetadata`.
    pub fn parse(buf: &[u8], floor: u32, len: u32) -> Result<Self, SFSError> {
        if buf.is_empty() || buf.len() % BLOCK_SIZE != 0 || (len as usize) > buf.len() * 8 {
            return Err(SFSError::CorruptMetadata(format!(
                "bitmap of {} bytes cannot track {} units",
                buf.len(),
                len
            )));
        }

        let words = buf
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        let mut bmp = Self {
            words,
            floor,
            len,
            free: 0,
        };

        if let Some(i) = (0..floor).find(|&i| bmp.get(i) == State::Free) {
            return Err(SFSError::CorruptMetadata(format!(
                "reserved unit {} is marked free",
                i
            )));
        }
        bmp.free = (floor..len).filter(|&i| bmp.get(i) == State::Free).count() as u32;
        Ok(bmp)
    }

    /// Encodes the bitmap as raw little endian bytes, a whole number of blocks.
    pub fn serialize(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Number of disk blocks backing this bitmap.
    pub fn nr_blocks(&self) -> usize {
        self.words.len() / WORDS_PER_BLOCK
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn get(&self, index: u32) -> State {
        let word = self.words[(index / WORD_BITS) as usize];
        let mask = 0b01_u64 << (index % WORD_BITS);
        if word & mask == 0 {
            State::Used
        } else {
            State::Free
        }
    }

    fn set_reserved(&mut self, index: u32) {
        let mask = 0b01_u64 << (index % WORD_BITS);
        self.words[(index / WORD_BITS) as usize] &= !mask;
    }

    fn set_free(&mut self, index: u32) {
        let mask = 0b01_u64 << (index % WORD_BITS);
        self.words[(index / WORD_BITS) as usize] |= mask;
    }

    /// Takes the lowest free unit.
    pub fn allocate(&mut self) -> Result<u32, SFSError> {
        let first_word = (self.floor / WORD_BITS) as usize;
        let found = self
            .words
            .iter()
            .enumerate()
            .skip(first_word)
            .find(|(_, word)| **word != 0)
            .map(|(w, word)| w as u32 * WORD_BITS + word.trailing_zeros());

        match found {
            Some(index) if index < self.len => {
                // Bits under the floor are never free, so the first set bit is in range.
                debug_assert!(index >= self.floor);
                self.set_reserved(index);
                self.free -= 1;
                debug!("allocated unit {}, {} free", index, self.free);
                Ok(index)
            }
            _ => Err(SFSError::OutOfSpace),
        }
    }

    /// Takes the lowest run of `count` consecutive free units and returns its
    /// first index. Fragmented free space does not satisfy the request even if
    /// the total is large enough.
    pub fn allocate_run(&mut self, count: u32) -> Result<u32, SFSError> {
        if count == 0 {
            return Err(SFSError::InvalidArgument(
                "cannot allocate an empty run".to_string(),
            ));
        }
        if count > self.free {
            return Err(SFSError::OutOfSpace);
        }

        let mut run_start = self.floor;
        let mut run_len = 0;
        let mut index = self.floor;
        while index < self.len {
            // Skip fully used words quickly.
            if index % WORD_BITS == 0 && self.words[(index / WORD_BITS) as usize] == 0 {
                run_len = 0;
                index += WORD_BITS;
                continue;
            }
            if self.get(index) == State::Free {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.set_reserved(i);
                    }
                    self.free -= count;
                    debug!(
                        "allocated run {}..{}, {} free",
                        run_start,
                        run_start + count,
                        self.free
                    );
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
            }
            index += 1;
        }
        Err(SFSError::OutOfSpace)
    }

    /// Returns a unit to the free pool.
    ///
    /// # Errors
    ///
    /// Releasing an index outside `floor..len` or a unit that is already free
    /// means some other metadata is wrong; both are reported rather than
    /// silently absorbed.
    pub fn free(&mut self, index: u32) -> Result<(), SFSError> {
        if index < self.floor || index >= self.len {
            error!("attempt to free unit {} outside {}..{}", index, self.floor, self.len);
            return Err(SFSError::InvalidIndex(index));
        }
        if self.get(index) == State::Free {
            error!("unit {} freed twice", index);
            return Err(SFSError::DoubleFree(index));
        }
        self.set_free(index);
        self.free += 1;
        debug!("freed unit {}, {} free", index, self.free);
        Ok(())
    }

    /// Releases `count` units starting at `start`. Every unit is checked before
    /// any bit changes, so a bad run leaves the bitmap untouched.
    pub fn free_run(&mut self, start: u32, count: u32) -> Result<(), SFSError> {
        let end = start.checked_add(count).ok_or(SFSError::InvalidIndex(start))?;
        if start < self.floor || end > self.len {
            error!(
                "attempt to free run {}..{} outside {}..{}",
                start, end, self.floor, self.len
            );
            return Err(SFSError::InvalidIndex(start));
        }
        for i in start..end {
            if self.get(i) == State::Free {
                error!("unit {} freed twice", i);
                return Err(SFSError::DoubleFree(i));
            }
        }
        for i in start..end {
            self.set_free(i);
        }
        self.free += count;
        debug!("freed run {}..{}, {} free", start, end, self.free);
        Ok(())
    }
}
