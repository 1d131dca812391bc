use extentfs::io::FileBlockEmulatorBuilder;
use extentfs::layout::ROOT_INO;
use extentfs::node::S_IFREG;
use extentfs::{SuperOperations, SFS};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_size(256)
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new file system on the device and grow one file in /
    let sfs = SFS::format(dev).expect("should format");
    let ino = sfs
        .create(ROOT_INO, b"hello", S_IFREG | 0o644, 0, 0)
        .unwrap();
    sfs.append(ino, 0, 4).unwrap();
    sfs.append(ino, 4, 2).unwrap();

    for extent in sfs.extents(ino).unwrap() {
        println!(
            "logical {}..{} -> physical {}..{}",
            extent.ee_block,
            extent.logical_end(),
            extent.ee_start,
            extent.physical_end()
        );
    }
    println!("{:?}", sfs.stat());
    sfs.unmount().unwrap();
}
