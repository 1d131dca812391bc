//! A small extent based file system on top of any fixed size block device.
//!
//! The crate covers the on-disk format and everything that mutates it:
//! geometry, the two allocation bitmaps, the inode store, per file extent
//! indexes and directory blocks. Mounting into a host VFS is left to the
//! caller, which drives the file system through [`SFS`] and the
//! [`SuperOperations`] hooks.
pub mod alloc;
pub mod dir;
pub mod extent;
mod fs;
pub mod io;
pub mod layout;
pub mod node;
mod sb;

pub use crate::fs::{SFSError, StatFs, SuperOperations, SFS};
pub use crate::layout::Geometry;
pub use crate::node::Inode;
pub use crate::sb::SuperBlock;
