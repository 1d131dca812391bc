mod block;
mod buffer;
mod diskemu;

pub use block::{BlockNumber, BlockStorage};
pub use buffer::BlockBuffer;
pub use diskemu::{FileBlockEmulator, FileBlockEmulatorBuilder};
