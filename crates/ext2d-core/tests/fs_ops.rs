//! End-to-end tests against freshly formatted in-memory volumes.

use ext2d_block::{ByteDevice, FileByteDevice, MemByteDevice};
use ext2d_core::format::{format, Geometry};
use ext2d_core::{FsContext, MountOptions};
use ext2d_error::Ext2Error;
use ext2d_ondisk::FileType;
use ext2d_types::{InodeNumber, ROOT_INO};

const ROOT: InodeNumber = InodeNumber(ROOT_INO);

fn fresh_fs(blocks: u32) -> FsContext<MemByteDevice> {
    // RUST_LOG=ext2d_core=trace shows mount/allocator/read-ahead activity.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dev = MemByteDevice::new(blocks as usize * 1024);
    format(&dev, &Geometry::small(blocks)).unwrap();
    FsContext::mount(dev, MountOptions::default()).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn fresh_volume_has_a_root_directory_and_sane_counters() {
    let mut fs = fresh_fs(2048);

    let stats = fs.statvfs();
    assert_eq!(stats.block_size, 1024);
    assert_eq!(stats.blocks, 2048);
    assert_eq!(stats.groups, 1);
    assert_eq!(stats.inodes, 1024);
    assert!(stats.free_blocks > 0);
    // Inodes 1..=10 are reserved.
    assert_eq!(stats.free_inodes, 1024 - 10);

    let root = fs.stat(ROOT).unwrap();
    assert_eq!(root.links, 2);
    assert_eq!(root.size, 1024);

    let entries = fs.readdir(ROOT, 0).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![b".".to_vec(), b"..".to_vec()]);
    assert!(entries.iter().all(|e| e.file_type == FileType::Dir));
    assert!(entries.iter().all(|e| e.ino == ROOT));
}

#[test]
fn create_write_read_round_trip() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"a.txt", 0o644, 0, 0).unwrap();
    assert_eq!(fs.lookup(ROOT, b"a.txt").unwrap(), (ino, FileType::Regular));

    let data = pattern(3000, 7);
    assert_eq!(fs.write(ino, 0, &data).unwrap(), 3000);
    assert_eq!(fs.stat(ino).unwrap().size, 3000);

    let mut out = vec![0_u8; 3000];
    assert_eq!(fs.read(ino, 0, &mut out).unwrap(), 3000);
    assert_eq!(out, data);

    // Reads past end of file are clamped.
    let mut tail = vec![0_u8; 100];
    assert_eq!(fs.read(ino, 2990, &mut tail).unwrap(), 10);
    assert_eq!(&tail[..10], &data[2990..]);
}

#[test]
fn data_survives_unmount_and_remount() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"keep", 0o644, 0, 0).unwrap();
    let data = pattern(5000, 3);
    fs.write(ino, 0, &data).unwrap();

    let dev = fs.unmount().unwrap();
    let mut fs = FsContext::mount(dev, MountOptions::default()).unwrap();

    let (found, _) = fs.lookup(ROOT, b"keep").unwrap();
    assert_eq!(found, ino);
    let mut out = vec![0_u8; 5000];
    assert_eq!(fs.read(found, 0, &mut out).unwrap(), 5000);
    assert_eq!(out, data);
}

#[test]
fn thirteenth_block_goes_through_the_single_indirect() {
    let mut fs = fresh_fs(2048);
    let before = fs.statvfs().free_blocks;

    let ino = fs.create(ROOT, b"big", 0o644, 0, 0).unwrap();
    let data = pattern(13 * 1024, 1);
    fs.write(ino, 0, &data).unwrap();

    // 13 data blocks plus the single-indirect block.
    let st = fs.stat(ino).unwrap();
    assert_eq!(st.blocks512, 14 * 2);
    assert_eq!(fs.statvfs().free_blocks, before - 14);

    let mut out = vec![0_u8; 13 * 1024];
    fs.read(ino, 0, &mut out).unwrap();
    assert_eq!(out, data);

    // Truncating to zero releases the indirect block too.
    fs.truncate(ino, 0).unwrap();
    assert_eq!(fs.stat(ino).unwrap().blocks512, 0);
    assert_eq!(fs.statvfs().free_blocks, before);
}

#[test]
fn double_indirect_offsets_round_trip() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"deep", 0o644, 0, 0).unwrap();

    // First logical block inside the double-indirect range for 1 KiB
    // blocks: 12 direct + 256 single-indirect.
    let offset = (12 + 256) * 1024_u64;
    let data = pattern(2048, 9);
    fs.write(ino, offset, &data).unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, offset + 2048);

    let mut out = vec![0_u8; 2048];
    assert_eq!(fs.read(ino, offset, &mut out).unwrap(), 2048);
    assert_eq!(out, data);

    // The leading region was never written and reads as zeroes.
    let mut hole = vec![0xFF_u8; 1024];
    fs.read(ino, 0, &mut hole).unwrap();
    assert_eq!(hole, vec![0_u8; 1024]);
}

#[test]
fn sparse_files_read_zeroes_in_holes() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"sparse", 0o644, 0, 0).unwrap();
    fs.write(ino, 5000, b"tail").unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, 5004);

    let mut out = vec![0xFF_u8; 1024];
    assert_eq!(fs.read(ino, 0, &mut out).unwrap(), 1024);
    assert_eq!(out, vec![0_u8; 1024]);

    let mut tail = vec![0_u8; 4];
    fs.read(ino, 5000, &mut tail).unwrap();
    assert_eq!(&tail, b"tail");
}

#[test]
fn unlink_removes_the_name_and_reclaims_the_inode() {
    let mut fs = fresh_fs(2048);
    let free_before = fs.statvfs().free_inodes;

    let ino = fs.create(ROOT, b"gone", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &pattern(2048, 5)).unwrap();
    assert_eq!(fs.statvfs().free_inodes, free_before - 1);

    fs.unlink(ROOT, b"gone").unwrap();
    assert!(matches!(fs.lookup(ROOT, b"gone"), Err(Ext2Error::NotFound)));
    assert_eq!(fs.statvfs().free_inodes, free_before);
}

#[test]
fn hard_links_share_the_inode_until_the_last_name_drops() {
    let mut fs = fresh_fs(2048);
    let free_inodes = fs.statvfs().free_inodes;

    let ino = fs.create(ROOT, b"first", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, b"shared bytes").unwrap();
    fs.link(ROOT, b"second", ino).unwrap();
    assert_eq!(fs.stat(ino).unwrap().links, 2);
    assert_eq!(fs.lookup(ROOT, b"second").unwrap().0, ino);

    fs.unlink(ROOT, b"first").unwrap();
    assert_eq!(fs.stat(ino).unwrap().links, 1);
    let mut out = vec![0_u8; 12];
    fs.read(ino, 0, &mut out).unwrap();
    assert_eq!(&out, b"shared bytes");

    fs.unlink(ROOT, b"second").unwrap();
    assert_eq!(fs.statvfs().free_inodes, free_inodes);
}

#[test]
fn linking_a_directory_is_refused() {
    let mut fs = fresh_fs(2048);
    let dir = fs.mkdir(ROOT, b"d", 0o755, 0, 0).unwrap();
    assert!(matches!(
        fs.link(ROOT, b"d2", dir),
        Err(Ext2Error::IsDirectory)
    ));
}

#[test]
fn mkdir_and_rmdir_maintain_the_parent_link_count() {
    let mut fs = fresh_fs(2048);
    assert_eq!(fs.stat(ROOT).unwrap().links, 2);

    let dir = fs.mkdir(ROOT, b"d", 0o755, 0, 0).unwrap();
    assert_eq!(fs.stat(ROOT).unwrap().links, 3);
    assert_eq!(fs.stat(dir).unwrap().links, 2);
    assert_eq!(fs.lookup(dir, b"..").unwrap().0, ROOT);

    let file = fs.create(dir, b"f", 0o644, 0, 0).unwrap();
    assert!(matches!(fs.rmdir(ROOT, b"d"), Err(Ext2Error::NotEmpty)));
    let _ = file;

    fs.unlink(dir, b"f").unwrap();
    fs.rmdir(ROOT, b"d").unwrap();
    assert!(matches!(fs.lookup(ROOT, b"d"), Err(Ext2Error::NotFound)));
    assert_eq!(fs.stat(ROOT).unwrap().links, 2);
}

#[test]
fn directory_growth_appends_exactly_one_block() {
    let mut fs = fresh_fs(2048);
    assert_eq!(fs.stat(ROOT).unwrap().size, 1024);

    let mut created = Vec::new();
    for i in 0..200 {
        let name = format!("f{i:03}");
        fs.create(ROOT, name.as_bytes(), 0o644, 0, 0).unwrap();
        created.push(name);
        if fs.stat(ROOT).unwrap().size > 1024 {
            break;
        }
    }
    assert_eq!(fs.stat(ROOT).unwrap().size, 2048);

    for name in &created {
        fs.lookup(ROOT, name.as_bytes()).unwrap();
    }
}

#[test]
fn deleted_directory_slots_are_reused_without_growth() {
    let mut fs = fresh_fs(2048);
    fs.create(ROOT, b"victim", 0o644, 0, 0).unwrap();
    let size = fs.stat(ROOT).unwrap().size;

    fs.unlink(ROOT, b"victim").unwrap();
    fs.create(ROOT, b"newbie", 0o644, 0, 0).unwrap();
    assert_eq!(fs.stat(ROOT).unwrap().size, size);
    fs.lookup(ROOT, b"newbie").unwrap();
}

#[test]
fn rename_within_a_directory() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"old", 0o644, 0, 0).unwrap();
    fs.rename(ROOT, b"old", ROOT, b"new").unwrap();
    assert!(matches!(fs.lookup(ROOT, b"old"), Err(Ext2Error::NotFound)));
    assert_eq!(fs.lookup(ROOT, b"new").unwrap().0, ino);
}

#[test]
fn rename_across_directories_repoints_dotdot() {
    let mut fs = fresh_fs(2048);
    let a = fs.mkdir(ROOT, b"a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(ROOT, b"b", 0o755, 0, 0).unwrap();
    let c = fs.mkdir(a, b"c", 0o755, 0, 0).unwrap();
    assert_eq!(fs.stat(a).unwrap().links, 3);

    fs.rename(a, b"c", b, b"c").unwrap();

    assert!(matches!(fs.lookup(a, b"c"), Err(Ext2Error::NotFound)));
    assert_eq!(fs.lookup(b, b"c").unwrap().0, c);
    assert_eq!(fs.lookup(c, b"..").unwrap().0, b);
    assert_eq!(fs.stat(a).unwrap().links, 2);
    assert_eq!(fs.stat(b).unwrap().links, 3);
}

#[test]
fn rename_replaces_a_compatible_destination() {
    let mut fs = fresh_fs(2048);
    let free_inodes = fs.statvfs().free_inodes;

    let x = fs.create(ROOT, b"x", 0o644, 0, 0).unwrap();
    fs.create(ROOT, b"y", 0o644, 0, 0).unwrap();
    fs.rename(ROOT, b"x", ROOT, b"y").unwrap();

    assert!(matches!(fs.lookup(ROOT, b"x"), Err(Ext2Error::NotFound)));
    assert_eq!(fs.lookup(ROOT, b"y").unwrap().0, x);
    // The displaced inode went back to the bitmap.
    assert_eq!(fs.statvfs().free_inodes, free_inodes - 1);
}

#[test]
fn rename_into_its_own_subtree_is_refused() {
    let mut fs = fresh_fs(2048);
    let a = fs.mkdir(ROOT, b"a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(a, b"b", 0o755, 0, 0).unwrap();
    assert!(matches!(
        fs.rename(ROOT, b"a", b, b"a"),
        Err(Ext2Error::InvalidArgument(_))
    ));
    // Nothing moved.
    assert_eq!(fs.lookup(ROOT, b"a").unwrap().0, a);
    assert_eq!(fs.lookup(a, b"b").unwrap().0, b);
}

#[test]
fn symlinks_round_trip_inline_and_block_targets() {
    let mut fs = fresh_fs(2048);

    let short = fs.symlink(ROOT, b"s", b"target/file", 0, 0).unwrap();
    assert_eq!(fs.read_link(short).unwrap(), b"target/file");
    let st = fs.stat(short).unwrap();
    assert_eq!(st.size, 11);
    // Inline target: no data block.
    assert_eq!(st.blocks512, 0);

    let long_target = vec![b'p'; 100];
    let long = fs.symlink(ROOT, b"l", &long_target, 0, 0).unwrap();
    assert_eq!(fs.read_link(long).unwrap(), long_target);
    assert_eq!(fs.stat(long).unwrap().blocks512, 2);

    let (not_a_link, _) = fs.lookup(ROOT, b"..").unwrap();
    assert!(matches!(
        fs.read_link(not_a_link),
        Err(Ext2Error::InvalidArgument(_))
    ));
}

#[test]
fn mknod_keeps_the_device_number() {
    let mut fs = fresh_fs(2048);
    let dev = fs
        .mknod(ROOT, b"tty", ext2d_types::S_IFCHR | 0o600, 0x0501, 0, 0)
        .unwrap();
    let st = fs.stat(dev).unwrap();
    assert_eq!(st.rdev, 0x0501);
    assert_eq!(fs.lookup(ROOT, b"tty").unwrap().1, FileType::Chrdev);

    assert!(matches!(
        fs.mknod(ROOT, b"plain", 0o644, 0, 0, 0),
        Err(Ext2Error::InvalidArgument(_))
    ));
}

#[test]
fn truncate_zeroes_the_tail_of_the_partial_block() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"t", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &vec![0xAA_u8; 2000]).unwrap();

    fs.truncate(ino, 1500).unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, 1500);

    // Growing again must expose zeroes, not the old tail bytes.
    fs.write(ino, 1800, &[0xBB]).unwrap();
    let mut out = vec![0xFF_u8; 300];
    assert_eq!(fs.read(ino, 1500, &mut out).unwrap(), 300);
    assert_eq!(out, vec![0_u8; 300]);
}

#[test]
fn punch_hole_frees_blocks_but_keeps_the_size() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"h", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &vec![0xCC_u8; 5 * 1024]).unwrap();
    assert_eq!(fs.stat(ino).unwrap().blocks512, 10);

    fs.punch_hole(ino, 1024, 3072).unwrap();

    let st = fs.stat(ino).unwrap();
    assert_eq!(st.size, 5 * 1024);
    assert_eq!(st.blocks512, 6);

    let mut out = vec![0xFF_u8; 2048];
    fs.read(ino, 1024, &mut out).unwrap();
    assert_eq!(out, vec![0_u8; 2048]);
    let mut head = vec![0_u8; 1024];
    fs.read(ino, 0, &mut head).unwrap();
    assert_eq!(head, vec![0xCC_u8; 1024]);
}

#[test]
fn punch_hole_to_eof_zeroes_the_partial_tail() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"tail", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &vec![0xCC_u8; 5632]).unwrap();

    // The hole ends exactly at the file size, in a partial block.
    fs.punch_hole(ino, 0, 5632).unwrap();

    assert_eq!(fs.stat(ino).unwrap().size, 5632);
    let mut out = vec![0xFF_u8; 5632];
    fs.read(ino, 0, &mut out).unwrap();
    assert_eq!(out, vec![0_u8; 5632]);
}

#[test]
fn punch_hole_inside_one_block_zeroes_only_that_range() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"head", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &vec![0xAB_u8; 2048]).unwrap();

    fs.punch_hole(ino, 0, 512).unwrap();

    let mut out = vec![0_u8; 2048];
    fs.read(ino, 0, &mut out).unwrap();
    assert_eq!(&out[..512], &[0_u8; 512][..]);
    assert_eq!(&out[512..], &vec![0xAB_u8; 1536][..]);
}

#[test]
fn new_inodes_record_the_callers_uid_and_gid() {
    let mut fs = fresh_fs(2048);

    let file = fs.create(ROOT, b"owned", 0o644, 1000, 100).unwrap();
    let st = fs.stat(file).unwrap();
    assert_eq!((st.uid, st.gid), (1000, 100));

    let dir = fs.mkdir(ROOT, b"home", 0o755, 1000, 100).unwrap();
    let st = fs.stat(dir).unwrap();
    assert_eq!((st.uid, st.gid), (1000, 100));

    let link = fs.symlink(ROOT, b"alias", b"owned", 7, 8).unwrap();
    let st = fs.stat(link).unwrap();
    assert_eq!((st.uid, st.gid), (7, 8));
}

/// Device whose reads fail at or past `limit`, for exercising the advisory
/// read-ahead path against a bad region of the disk.
struct ShortReadDevice {
    inner: MemByteDevice,
    limit: u64,
}

impl ByteDevice for ShortReadDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> ext2d_error::Result<()> {
        if offset >= self.limit {
            return Err(Ext2Error::Io(std::io::Error::other("bad sector")));
        }
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> ext2d_error::Result<()> {
        self.inner.write_all_at(offset, buf)
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn sync(&self) -> ext2d_error::Result<()> {
        self.inner.sync()
    }
}

#[test]
fn read_ahead_failure_falls_back_to_demand_fetches() {
    let mut fs = fresh_fs(2048);
    let ino = fs.create(ROOT, b"two-blocks", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, &vec![b'A'; 1024]).unwrap();
    fs.write(ino, 1024, &vec![b'B'; 1024]).unwrap();
    let image = fs.unmount().unwrap().snapshot();

    // Remount with the second data block unreadable. Read-ahead for the
    // first block will trip over it; the demand fetch must still succeed.
    let b_block = (0..image.len() / 1024)
        .find(|&b| image[b * 1024..(b + 1) * 1024].iter().all(|&x| x == b'B'))
        .unwrap();
    let dev = ShortReadDevice {
        inner: MemByteDevice::from_bytes(image),
        limit: b_block as u64 * 1024,
    };
    let mut fs = FsContext::mount(dev, MountOptions::default()).unwrap();

    let (found, _) = fs.lookup(ROOT, b"two-blocks").unwrap();
    let mut out = vec![0_u8; 1024];
    fs.read(found, 0, &mut out).unwrap();
    assert_eq!(out, vec![b'A'; 1024]);
}

#[test]
fn readdir_resumes_from_next_pos_without_duplicates() {
    let mut fs = fresh_fs(2048);
    fs.create(ROOT, b"f1", 0o644, 0, 0).unwrap();
    fs.create(ROOT, b"f2", 0o644, 0, 0).unwrap();

    let all = fs.readdir(ROOT, 0).unwrap();
    assert_eq!(all.len(), 4);

    let resumed = fs.readdir(ROOT, all[1].next_pos).unwrap();
    let names: Vec<_> = resumed.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![b"f1".to_vec(), b"f2".to_vec()]);
}

#[test]
fn filling_the_volume_returns_no_space_and_stays_usable() {
    let mut fs = fresh_fs(300);
    let ino = fs.create(ROOT, b"filler", 0o644, 0, 0).unwrap();

    let huge = vec![0x5A_u8; 300 * 1024];
    assert!(matches!(
        fs.write(ino, 0, &huge),
        Err(Ext2Error::NoSpace)
    ));

    // Blocks allocated before the failure are reclaimed by truncation and
    // the volume keeps working.
    fs.truncate(ino, 0).unwrap();
    fs.write(ino, 0, b"small").unwrap();
    let mut out = vec![0_u8; 5];
    fs.read(ino, 0, &mut out).unwrap();
    assert_eq!(&out, b"small");
}

#[test]
fn read_only_mounts_refuse_mutation() {
    let dev = MemByteDevice::new(2048 * 1024);
    format(&dev, &Geometry::small(2048)).unwrap();
    let mut fs = FsContext::mount(
        dev,
        MountOptions {
            read_only: true,
            ..MountOptions::default()
        },
    )
    .unwrap();

    assert!(matches!(
        fs.create(ROOT, b"nope", 0o644, 0, 0),
        Err(Ext2Error::ReadOnly)
    ));
    assert!(matches!(
        fs.unlink(ROOT, b"anything"),
        Err(Ext2Error::ReadOnly)
    ));
    // Reads still work.
    assert_eq!(fs.readdir(ROOT, 0).unwrap().len(), 2);
}

#[test]
fn format_and_remount_on_a_real_file() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(2048 * 1024).unwrap();

    let dev = FileByteDevice::open_with(tmp.path(), true).unwrap();
    format(&dev, &Geometry::small(2048)).unwrap();

    let mut fs = FsContext::mount(dev, MountOptions::default()).unwrap();
    let ino = fs.create(ROOT, b"on-disk", 0o644, 0, 0).unwrap();
    fs.write(ino, 0, b"persisted").unwrap();
    fs.unmount().unwrap();

    let dev = FileByteDevice::open_with(tmp.path(), false).unwrap();
    let mut fs = FsContext::mount(dev, MountOptions::default()).unwrap();
    let (found, _) = fs.lookup(ROOT, b"on-disk").unwrap();
    let mut out = vec![0_u8; 9];
    fs.read(found, 0, &mut out).unwrap();
    assert_eq!(&out, b"persisted");
}
