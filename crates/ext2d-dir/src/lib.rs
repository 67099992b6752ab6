#![forbid(unsafe_code)]
//! Packed directory-entry block operations.
//!
//! A directory's data blocks hold contiguous variable-length records:
//! inode number (4), record length (2), name length (1), file-type tag (1),
//! then the name bytes with no terminator, padded to 4-byte alignment. The
//! record lengths in a block always sum to exactly the block size; free
//! space is carried as slack inside records or as records with inode 0.
//!
//! Everything here works on a single block buffer. Walking a directory's
//! blocks, the insertion hint, and growth live with the caller.

use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::FileType;
use ext2d_types::MAX_NAME_LEN;

/// Fixed header preceding the name bytes.
pub const DIRENT_HEADER_LEN: usize = 8;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Packed size of an entry carrying an `name_len`-byte name.
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    align4(DIRENT_HEADER_LEN + name_len)
}

fn dirent_corruption(detail: impl Into<String>) -> Ext2Error {
    Ext2Error::Corruption {
        block: 0,
        detail: detail.into(),
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Ext2Error::Format(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Ext2Error::NameTooLong);
    }
    Ok(())
}

/// Borrowed view of one record inside a block. `ino == 0` marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub offset: usize,
    pub ino: u32,
    pub rec_len: usize,
    pub file_type: FileType,
    pub name: &'a [u8],
}

impl EntryRef<'_> {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.ino == 0
    }

    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

fn read_entry_at(block: &[u8], offset: usize) -> Result<EntryRef<'_>> {
    let header = block
        .get(offset..offset + DIRENT_HEADER_LEN)
        .ok_or_else(|| dirent_corruption("directory record header past block end"))?;
    let ino = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let rec_len = usize::from(u16::from_le_bytes([header[4], header[5]]));
    let name_len = usize::from(header[6]);
    let file_type = FileType::from_tag(header[7]);

    if rec_len < DIRENT_HEADER_LEN || rec_len % 4 != 0 {
        return Err(dirent_corruption(format!(
            "directory record at {offset} has invalid rec_len {rec_len}"
        )));
    }
    if offset
        .checked_add(rec_len)
        .map_or(true, |end| end > block.len())
    {
        return Err(dirent_corruption(format!(
            "directory record at {offset} exceeds block"
        )));
    }
    if DIRENT_HEADER_LEN + name_len > rec_len {
        return Err(dirent_corruption(format!(
            "directory record at {offset} has name_len {name_len} past its rec_len"
        )));
    }
    Ok(EntryRef {
        offset,
        ino,
        rec_len,
        file_type,
        name: &block[offset + DIRENT_HEADER_LEN..offset + DIRENT_HEADER_LEN + name_len],
    })
}

/// Iterator over every record in a block, free slots included.
///
/// A malformed record yields one `Err` and ends the iteration.
pub struct EntryIter<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<EntryRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        match read_entry_at(self.block, self.offset) {
            Ok(entry) => {
                self.offset += entry.rec_len;
                Some(Ok(entry))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Walk all records of `block`.
#[must_use]
pub fn entries(block: &[u8]) -> EntryIter<'_> {
    EntryIter {
        block,
        offset: 0,
        failed: false,
    }
}

/// Find the live record named `name`, if any.
pub fn find_entry<'a>(block: &'a [u8], name: &[u8]) -> Result<Option<EntryRef<'a>>> {
    for entry in entries(block) {
        let entry = entry?;
        if !entry.is_free() && entry.name == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    rec_len: usize,
    file_type: FileType,
    name: &[u8],
) -> Result<()> {
    let end = offset
        .checked_add(rec_len)
        .filter(|&end| end <= block.len())
        .ok_or_else(|| dirent_corruption("directory record would exceed the block"))?;
    if rec_len < required_rec_len(name.len()) {
        return Err(Ext2Error::Format(format!(
            "rec_len {rec_len} too small for a {}-byte name",
            name.len()
        )));
    }
    let rec_len_u16 = u16::try_from(rec_len)
        .map_err(|_| Ext2Error::Format("directory rec_len exceeds u16".to_owned()))?;
    let name_len_u8 = u8::try_from(name.len()).map_err(|_| Ext2Error::NameTooLong)?;

    block[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
    block[offset + 4..offset + 6].copy_from_slice(&rec_len_u16.to_le_bytes());
    block[offset + 6] = name_len_u8;
    block[offset + 7] = file_type as u8;
    block[offset + DIRENT_HEADER_LEN..offset + DIRENT_HEADER_LEN + name.len()]
        .copy_from_slice(name);
    block[offset + DIRENT_HEADER_LEN + name.len()..end].fill(0);
    Ok(())
}

/// Insert `name -> ino` into this block.
///
/// Reuses a free slot with enough room, or splits the slack off a live
/// record. Returns the byte offset of the new record, or [`Ext2Error::NoSpace`]
/// when the block cannot take it; the caller decides whether to try another
/// block or grow the directory.
pub fn add_entry(block: &mut [u8], ino: u32, name: &[u8], file_type: FileType) -> Result<usize> {
    if ino == 0 {
        return Err(Ext2Error::Format(
            "directory entry inode cannot be zero".to_owned(),
        ));
    }
    validate_name(name)?;
    let need = required_rec_len(name.len());

    let mut offset = 0;
    while offset < block.len() {
        // Copy the scalars out; the record view borrows the block we are
        // about to mutate.
        let (free, rec_len, live) = {
            let entry = read_entry_at(block, offset)?;
            (
                entry.is_free(),
                entry.rec_len,
                required_rec_len(entry.name.len()),
            )
        };

        if free {
            if rec_len >= need {
                write_entry(block, offset, ino, rec_len, file_type, name)?;
                return Ok(offset);
            }
        } else if rec_len - live >= need {
            // Shrink the live record to its packed size and put the new
            // one in the freed tail.
            let live_u16 = u16::try_from(live)
                .map_err(|_| Ext2Error::Format("directory rec_len exceeds u16".to_owned()))?;
            block[offset + 4..offset + 6].copy_from_slice(&live_u16.to_le_bytes());
            let new_offset = offset + live;
            write_entry(block, new_offset, ino, rec_len - live, file_type, name)?;
            return Ok(new_offset);
        }
        offset += rec_len;
    }

    Err(Ext2Error::NoSpace)
}

/// Delete the record named `name` from this block.
///
/// The slot's inode number is zeroed; when a preceding record exists its
/// `rec_len` absorbs the whole slot, so free space coalesces forward and a
/// block is never compacted. Returns the inode number the entry held, or
/// `None` when the name is not in this block.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<Option<u32>> {
    validate_name(name)?;

    let mut offset = 0;
    // Predecessor record as (offset, rec_len); keeping a view alive would
    // pin the block against the mutation below.
    let mut prev: Option<(usize, usize)> = None;
    while offset < block.len() {
        let (ino, rec_len, matched) = {
            let entry = read_entry_at(block, offset)?;
            (
                entry.ino,
                entry.rec_len,
                !entry.is_free() && entry.name == name,
            )
        };
        if matched {
            if let Some((prev_offset, prev_rec_len)) = prev {
                let merged = prev_rec_len + rec_len;
                let merged_u16 = u16::try_from(merged)
                    .map_err(|_| Ext2Error::Format("merged rec_len exceeds u16".to_owned()))?;
                block[prev_offset + 4..prev_offset + 6]
                    .copy_from_slice(&merged_u16.to_le_bytes());
            }
            block[offset..offset + 4].fill(0);
            return Ok(Some(ino));
        }
        prev = Some((offset, rec_len));
        offset += rec_len;
    }
    Ok(None)
}

/// Whether every live record in this block is `.` or `..`.
pub fn only_dots(block: &[u8]) -> Result<bool> {
    for entry in entries(block) {
        let entry = entry?;
        if !entry.is_free() && !entry.is_dot_or_dotdot() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Lay out a fresh directory block holding exactly `.` and `..`, with `..`
/// owning all remaining space in the block.
pub fn init_dir_block(block: &mut [u8], self_ino: u32, parent_ino: u32) -> Result<()> {
    let dot_len = required_rec_len(1);
    if block.len() < dot_len + required_rec_len(2) {
        return Err(Ext2Error::Format(
            "directory block too small for . and ..".to_owned(),
        ));
    }
    block.fill(0);
    write_entry(block, 0, self_ino, dot_len, FileType::Dir, b".")?;
    write_entry(
        block,
        dot_len,
        parent_ino,
        block.len() - dot_len,
        FileType::Dir,
        b"..",
    )?;
    Ok(())
}

/// Re-point the `..` record at a new parent. Returns whether the block held
/// one.
pub fn set_dotdot(block: &mut [u8], parent_ino: u32) -> Result<bool> {
    let Some(offset) = find_entry(block, b"..")?.map(|entry| entry.offset) else {
        return Ok(false);
    };
    block[offset..offset + 4].copy_from_slice(&parent_ino.to_le_bytes());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_names(block: &[u8]) -> Vec<Vec<u8>> {
        entries(block)
            .map(|e| e.unwrap())
            .filter(|e| !e.is_free())
            .map(|e| e.name.to_vec())
            .collect()
    }

    fn rec_len_sum(block: &[u8]) -> usize {
        entries(block).map(|e| e.unwrap().rec_len).sum()
    }

    #[test]
    fn init_dir_block_lays_out_dot_and_dotdot() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 11, 2).unwrap();
        let all: Vec<_> = entries(&block).map(|e| e.unwrap()).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, b".");
        assert_eq!(all[0].ino, 11);
        assert_eq!(all[0].file_type, FileType::Dir);
        assert_eq!(all[1].name, b"..");
        assert_eq!(all[1].ino, 2);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn add_entry_splits_slack_off_a_live_record() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2).unwrap();
        let off = add_entry(&mut block, 33, b"hello", FileType::Regular).unwrap();
        // `..` held the tail of the block; the new record lands right after
        // its packed size.
        assert_eq!(off, 12 + 12);
        assert_eq!(live_names(&block), vec![b".".to_vec(), b"..".to_vec(), b"hello".to_vec()]);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn lookup_after_insert_and_after_delete() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2).unwrap();
        add_entry(&mut block, 33, b"data.log", FileType::Regular).unwrap();

        let found = find_entry(&block, b"data.log").unwrap().unwrap();
        assert_eq!(found.ino, 33);
        assert_eq!(found.file_type, FileType::Regular);

        assert_eq!(remove_entry(&mut block, b"data.log").unwrap(), Some(33));
        assert_eq!(find_entry(&block, b"data.log").unwrap(), None);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn delete_merges_the_slot_into_its_predecessor() {
        // "a" (12 bytes) then "b" (12 bytes) then slack. Deleting "a" merges
        // it into the predecessor record; deleting the block-leading record
        // only zeroes its inode.
        let mut block = vec![0_u8; 1024];
        write_entry(&mut block, 0, 10, 12, FileType::Regular, b"a").unwrap();
        write_entry(&mut block, 12, 11, 12, FileType::Regular, b"b").unwrap();
        write_entry(&mut block, 24, 12, 1000, FileType::Regular, b"c").unwrap();

        assert_eq!(remove_entry(&mut block, b"b").unwrap(), Some(11));
        let first = read_entry_at(&block, 0).unwrap();
        assert_eq!(first.rec_len, 24);

        assert_eq!(remove_entry(&mut block, b"a").unwrap(), Some(10));
        let first = read_entry_at(&block, 0).unwrap();
        assert!(first.is_free());
        assert_eq!(first.rec_len, 24);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn freed_slot_is_reused_without_growing() {
        // Free slot of 12 bytes at the block head takes a name that packs
        // into 12 bytes, leaving the rest of the block untouched.
        let mut block = vec![0_u8; 1024];
        write_entry(&mut block, 0, 10, 12, FileType::Regular, b"a").unwrap();
        write_entry(&mut block, 12, 11, 1012, FileType::Regular, b"b").unwrap();
        remove_entry(&mut block, b"a").unwrap();

        let off = add_entry(&mut block, 44, b"abcd", FileType::Regular).unwrap();
        assert_eq!(off, 0);
        let reused = read_entry_at(&block, 0).unwrap();
        assert_eq!(reused.ino, 44);
        assert_eq!(reused.rec_len, 12);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn full_block_returns_no_space() {
        let mut block = vec![0_u8; 24];
        write_entry(&mut block, 0, 1, 12, FileType::Regular, b"a").unwrap();
        write_entry(&mut block, 12, 2, 12, FileType::Regular, b"b").unwrap();
        assert!(matches!(
            add_entry(&mut block, 3, b"c", FileType::Regular),
            Err(Ext2Error::NoSpace)
        ));
    }

    #[test]
    fn name_validation() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2).unwrap();
        assert!(matches!(
            add_entry(&mut block, 9, b"", FileType::Regular),
            Err(Ext2Error::Format(_))
        ));
        let long = vec![b'x'; MAX_NAME_LEN + 1];
        assert!(matches!(
            add_entry(&mut block, 9, &long, FileType::Regular),
            Err(Ext2Error::NameTooLong)
        ));
        // 255 bytes is still legal.
        let max = vec![b'y'; MAX_NAME_LEN];
        add_entry(&mut block, 9, &max, FileType::Regular).unwrap();
        assert!(find_entry(&block, &max).unwrap().is_some());
    }

    #[test]
    fn corrupt_rec_len_is_fatal() {
        let mut block = vec![0_u8; 64];
        write_entry(&mut block, 0, 1, 64, FileType::Regular, b"a").unwrap();
        // Misalign the record length.
        block[4..6].copy_from_slice(&13_u16.to_le_bytes());
        assert!(find_entry(&block, b"a").unwrap_err().is_fatal());
        // Point it past the block.
        block[4..6].copy_from_slice(&128_u16.to_le_bytes());
        assert!(find_entry(&block, b"a").unwrap_err().is_fatal());
    }

    #[test]
    fn only_dots_reports_emptiness() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 5, 2).unwrap();
        assert!(only_dots(&block).unwrap());

        add_entry(&mut block, 33, b"child", FileType::Dir).unwrap();
        assert!(!only_dots(&block).unwrap());

        remove_entry(&mut block, b"child").unwrap();
        assert!(only_dots(&block).unwrap());
    }

    #[test]
    fn set_dotdot_repoints_the_parent() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 5, 2).unwrap();
        assert!(set_dotdot(&mut block, 77).unwrap());
        assert_eq!(find_entry(&block, b"..").unwrap().unwrap().ino, 77);

        let mut plain = vec![0_u8; 1024];
        write_entry(&mut plain, 0, 1, 1024, FileType::Regular, b"x").unwrap();
        assert!(!set_dotdot(&mut plain, 77).unwrap());
    }

    #[test]
    fn slack_split_merge_and_repoint_share_a_block() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 5, 2).unwrap();
        // Split slack off the live `..` record twice, delete the middle name
        // so `..` absorbs its slot, then re-point `..`, all in one block.
        add_entry(&mut block, 33, b"mid", FileType::Regular).unwrap();
        add_entry(&mut block, 34, b"tail", FileType::Regular).unwrap();
        assert_eq!(remove_entry(&mut block, b"mid").unwrap(), Some(33));
        assert!(set_dotdot(&mut block, 99).unwrap());

        assert_eq!(find_entry(&block, b"..").unwrap().unwrap().ino, 99);
        assert_eq!(find_entry(&block, b"tail").unwrap().unwrap().ino, 34);
        assert_eq!(find_entry(&block, b"mid").unwrap(), None);
        assert_eq!(rec_len_sum(&block), 1024);
    }

    #[test]
    fn deleted_name_bytes_stay_in_place() {
        // Deletion zeroes only the inode number; the stale name is invisible
        // to lookup because the slot is free.
        let mut block = vec![0_u8; 1024];
        write_entry(&mut block, 0, 10, 1024, FileType::Regular, b"ghost").unwrap();
        remove_entry(&mut block, b"ghost").unwrap();
        let slot = read_entry_at(&block, 0).unwrap();
        assert!(slot.is_free());
        assert_eq!(slot.name, b"ghost");
        assert_eq!(find_entry(&block, b"ghost").unwrap(), None);
    }
}
