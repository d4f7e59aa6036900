//! End-to-end scenarios from the storage core's testable-properties section,
//! driven through real temporary files rather than the in-process unit
//! fixtures each module already covers on its own.

use historian_storage_core::{Archive, StorageError, StorageOptions};

fn options() -> StorageOptions {
    let mut opts = StorageOptions::new();
    opts.page_size(4096).unwrap();
    opts.maximum_pool_size(Some(16 * 1024 * 1024));
    opts.file_structure_block_size(4096).unwrap();
    opts
}

/// Scenario 1: create, write, commit, reopen.
#[test]
fn create_write_commit_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.d");
    let opts = options();

    {
        let archive = Archive::create(&opts, &path, 1).unwrap();
        let block_index = archive.header().committed_end() / 4096;
        assert_eq!(block_index, 11, "block index 10 is a reserved boundary block");

        let mut writer = archive.create_session(false, 1);
        writer.write_to_new_block(block_index, 1, 0).unwrap().fill(0x11);
        writer.finish_write(block_index);

        let mut header = archive.header();
        header.last_allocated_block = block_index as u32;
        header.snapshot_sequence_number = 1;
        archive.commit(header).unwrap();
    }

    let archive = Archive::open(&opts, &path, true, 1).unwrap();
    let mut reader = archive.create_session(true, 1);
    let data = reader.read(11, 1, 0).unwrap();
    assert!(data.iter().all(|b| *b == 0x11));
}

/// Scenario 2: a reader bound to an old snapshot keeps observing it even
/// after a later commit publishes a newer one.
#[test]
fn snapshot_isolation_across_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.d");
    let opts = options();
    let archive = Archive::create(&opts, &path, 1).unwrap();

    // First commit: snapshot 1, block 11.
    {
        let mut writer = archive.create_session(false, 1);
        writer.write_to_new_block(11, 1, 0).unwrap().fill(0xAA);
        writer.finish_write(11);
        let mut header = archive.header();
        header.last_allocated_block = 11;
        header.snapshot_sequence_number = 1;
        archive.commit(header).unwrap();
    }

    // A reader opened at the just-published snapshot 1.
    let mut old_reader = archive.create_session(true, 1);
    assert!(old_reader.read(11, 1, 0).is_ok());

    // Second commit: snapshot 2, a new block at index 12.
    {
        let mut writer = archive.create_session(false, 2);
        writer.write_to_new_block(12, 1, 0).unwrap().fill(0xBB);
        writer.finish_write(12);
        let mut header = archive.header();
        header.last_allocated_block = 12;
        header.snapshot_sequence_number = 2;
        archive.commit(header).unwrap();
    }

    // A fresh reader sees the new snapshot and block 12.
    let mut new_reader = archive.create_session(true, 2);
    let data = new_reader.read(12, 1, 0).unwrap();
    assert!(data.iter().all(|b| *b == 0xBB));

    // The reader still bound to snapshot 1 must not observe block 12's
    // newer-than-its-snapshot footer.
    let result = old_reader.read(12, 1, 0);
    assert!(matches!(result, Err(StorageError::PageNewerThanSnapshot { .. })));
}

/// Scenario 3: rollback discards uncommitted writes and leaves the
/// committed region and snapshot number untouched.
#[test]
fn rollback_discards_uncommitted_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.d");
    let opts = options();
    let archive = Archive::create(&opts, &path, 1).unwrap();
    let committed_before = archive.header().committed_end();
    let snapshot_before = archive.header().snapshot_sequence_number;

    {
        let mut writer = archive.create_session(false, 5);
        writer.write_to_new_block(11, 1, 0).unwrap().fill(0xCC);
        writer.finish_write(11);
    }
    archive.rollback();

    assert_eq!(archive.header().committed_end(), committed_before);
    assert_eq!(archive.header().snapshot_sequence_number, snapshot_before);

    let mut reader = archive.create_session(true, snapshot_before);
    let result = reader.read(11, 1, 0);
    assert!(result.is_err(), "block 11 was never committed");
}

/// Scenario 5: a directly-tampered footer surfaces as `ChecksumInvalid`
/// rather than silently returning corrupt bytes.
#[test]
fn footer_corruption_surfaces_as_checksum_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.d");
    let opts = options();

    {
        let archive = Archive::create(&opts, &path, 1).unwrap();
        let mut writer = archive.create_session(false, 1);
        writer.write_to_new_block(11, 1, 0).unwrap().fill(0x42);
        writer.finish_write(11);
        let mut header = archive.header();
        header.last_allocated_block = 11;
        header.snapshot_sequence_number = 1;
        archive.commit(header).unwrap();
    }

    // Block 11 occupies bytes [11*4096, 12*4096); its footer's checksum
    // state byte sits at offset 28 from the end of that range.
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let footer_state_offset: u64 = 11 * 4096 + (4096 - 32 + 28);
    file.seek(SeekFrom::Start(footer_state_offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(footer_state_offset)).unwrap();
    file.write_all(&[byte[0].wrapping_add(1)]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let archive = Archive::open(&opts, &path, true, 1).unwrap();
    let mut reader = archive.create_session(true, 1);
    let result = reader.read(11, 1, 0);
    assert!(matches!(result, Err(StorageError::ChecksumInvalid { .. })));
}
