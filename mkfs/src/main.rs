use std::convert::TryFrom;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use extentfs::io::{BlockStorage, FileBlockEmulator};
use extentfs::layout::{BLOCK_SIZE, INODE_SIZE, MIN_BLOCKS};
use extentfs::{Geometry, SuperBlock, SFS};
use log::debug;

/// Formats a disk image or block device with an extent file system.
#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about = None)]
struct MkfsArgs {
    /// the image file or block device to format
    disk: PathBuf,
}

/// Formats the whole of `disk`, returning the superblock and layout written.
fn format_disk(disk: &Path) -> anyhow::Result<(SuperBlock, Geometry)> {
    // block devices report their size through the end offset, not metadata
    let size = OpenOptions::new()
        .read(true)
        .write(true)
        .open(disk)
        .and_then(|mut file| file.seek(SeekFrom::End(0)))
        .with_context(|| format!("failed to open {}", disk.display()))?;
    let min = MIN_BLOCKS as u64 * BLOCK_SIZE as u64;
    if size < min {
        bail!(
            "{} holds {} bytes, at least {} are needed",
            disk.display(),
            size,
            min
        );
    }
    let nr_blocks = u32::try_from(size / BLOCK_SIZE as u64)
        .with_context(|| format!("{} is too large to address", disk.display()))?;
    debug!("{} bytes, {} blocks", size, nr_blocks);

    let dev = FileBlockEmulator::open_disk(disk, nr_blocks)
        .with_context(|| format!("failed to open {}", disk.display()))?;
    let fs = SFS::format(dev).context("failed to format")?;
    let sb = fs.superblock();
    let geo = fs.geometry();
    fs.unmount().context("failed to sync the new file system")?;
    Ok((sb, geo))
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = MkfsArgs::parse();
    let (sb, geo) = format_disk(&args.disk)?;

    println!("superblock: (magic={:#x}, nr_blocks={})", sb.magic, sb.nr_blocks);
    println!(
        "inode store: (nr_inodes={}, nr_istore_blocks={}, inode size={} bytes)",
        sb.nr_inodes, sb.nr_istore_blocks, INODE_SIZE
    );
    println!(
        "bitmaps: (nr_ifree_blocks={}, nr_bfree_blocks={})",
        sb.nr_ifree_blocks, sb.nr_bfree_blocks
    );
    println!(
        "free: (nr_free_inodes={}, nr_free_blocks={})",
        sb.nr_free_inodes, sb.nr_free_blocks
    );
    println!(
        "data: (first block={}, nr_data_blocks={})",
        geo.first_data_block(),
        geo.nr_data_blocks
    );
    Ok(())
}


#[cfg(test)]
mod format_disk_tests {
    use super::*;
    use extentfs::layout::ROOT_INO;
    use tempfile::NamedTempFile;

    #[test]
    fn binary_name_is_a_valid_target() {
        assert_eq!(env!("CARGO_BIN_NAME"), "mkfs-extentfs");
    }

    #[test]
    fn formats_the_whole_image() {
        let disk = NamedTempFile::new().unwrap();
        disk.as_file().set_len(1024 * BLOCK_SIZE as u64).unwrap();

        let (sb, geo) = format_disk(disk.path()).unwrap();
        assert_eq!(sb.nr_blocks, 1024);
        assert_eq!(sb.nr_free_blocks, geo.nr_data_blocks - 1);

        let dev = FileBlockEmulator::open_disk(disk.path(), 1024).unwrap();
        let fs = SFS::open(dev).unwrap();
        assert!(fs.read_inode(ROOT_INO).unwrap().is_dir());
    }

    #[test]
    fn small_images_are_rejected() {
        let disk = NamedTempFile::new().unwrap();
        disk.as_file().set_len(99 * BLOCK_SIZE as u64).unwrap();
        assert!(format_disk(disk.path()).is_err());
    }

    #[test]
    fn missing_images_are_rejected() {
        assert!(format_disk(Path::new("/nonexistent/disk.img")).is_err());
    }
}
