//! End-to-end engine scenarios: write/sync/stabilize pipelines, read
//! resolution across dirty and clean state, resource back-pressure and
//! error surfaces.

mod common;

use common::*;
use stripestore_engine::{DirtyState, WaitReason};

#[test]
fn full_block_write_roundtrip() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(1, 0);

    let data = vec![0xAA; BLOCK_SIZE as usize];
    assert_eq!(write(&mut store, obj, 1, 0, &data).retval, BLOCK_SIZE as i64);
    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
    store.run_until_idle();

    let out = read(&mut store, obj, 0, BLOCK_SIZE);
    assert_eq!(out.retval, BLOCK_SIZE as i64);
    assert_eq!(out.version, 1);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0xAA)]);

    // Promoted: one committed block, journal fully trimmed.
    assert_eq!(store.clean_entry(obj).unwrap().version, 1);
    assert_eq!(store.data_allocator().allocated_count(), 1);
    assert!(store.dirty_versions(obj).is_empty());
    assert!(store.journal().is_empty());
    assert_eq!(store.inode_space_stats().get(&1), Some(&u64::from(BLOCK_SIZE)));
}

#[test]
fn unsynced_small_write_visibility() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(2, 0);

    assert_eq!(write(&mut store, obj, 1, 0, &vec![0x11; 4096]).retval, 4096);

    // The newest completed version is visible to dirty reads.
    let out = read_dirty(&mut store, obj, 0, 8192);
    assert_eq!(out.retval, 8192);
    assert_filled(&out.data, &[(0, 4096, 0x11), (4096, 8192, 0x00)]);

    // A plain read sees no stable version yet.
    let out = read(&mut store, obj, 0, 8192);
    assert_filled(&out.data, &[(0, 8192, 0x00)]);

    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
    let out = read(&mut store, obj, 0, 8192);
    assert_filled(&out.data, &[(0, 4096, 0x11), (4096, 8192, 0x00)]);
}

#[test]
fn overlapping_small_writes_resolve_by_version() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(3, 0);

    assert_eq!(write(&mut store, obj, 1, 0, &vec![0x11; 4096]).retval, 4096);
    assert_eq!(
        write(&mut store, obj, 2, 2048, &vec![0x22; 4096]).retval,
        4096
    );
    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1), ver(obj, 2)]).retval, 0);

    let expect = [
        (0usize, 2048usize, 0x11u8),
        (2048, 6144, 0x22),
        (6144, 8192, 0x00),
    ];

    // Stable but not yet moved: served from the journal.
    let out = read(&mut store, obj, 0, 8192);
    assert_eq!(out.retval, 8192);
    assert_eq!(out.version, 2);
    assert_filled(&out.data, &expect);

    // After movement the same bytes come from the committed block.
    store.run_until_idle();
    assert_eq!(store.clean_entry(obj).unwrap().version, 2);
    assert!(store.dirty_versions(obj).is_empty());
    let out = read(&mut store, obj, 0, 8192);
    assert_filled(&out.data, &expect);
}

#[test]
fn delete_masks_and_retires_object() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(4, 0);

    put_stable(&mut store, obj, 1, 0, &vec![0xAA; BLOCK_SIZE as usize]);
    assert_eq!(store.data_allocator().allocated_count(), 1);

    assert_eq!(delete(&mut store, obj, 2).retval, 0);
    assert_eq!(sync(&mut store).retval, 0);

    // Synced deletion already masks the object for all readers.
    let out = read(&mut store, obj, 0, BLOCK_SIZE);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0x00)]);
    let out = read_dirty(&mut store, obj, 0, BLOCK_SIZE);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0x00)]);

    assert_eq!(stabilize(&mut store, &[ver(obj, 2)]).retval, 0);
    store.run_until_idle();

    assert!(store.clean_entry(obj).is_none());
    assert!(store.dirty_versions(obj).is_empty());
    assert_eq!(store.data_allocator().allocated_count(), 0);
    assert_eq!(store.inode_space_stats().get(&4), Some(&0));
}

#[test]
fn read_during_delete_movement_window() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(13, 0);

    put_stable(&mut store, obj, 1, 0, &vec![0xAA; BLOCK_SIZE as usize]);
    assert_eq!(delete(&mut store, obj, 2).retval, 0);
    assert_eq!(sync(&mut store).retval, 0);

    // Stop right at the stabilize callback: the deletion sits in
    // DEL_STABLE waiting for the flusher, with the old clean entry
    // still committed.
    let (slot, cb) = capture();
    store.enqueue(
        stripestore_engine::OpPayload::Stabilize {
            versions: vec![ver(obj, 2)],
        },
        cb,
    );
    assert_eq!(pump(&mut store, &slot).unwrap().retval, 0);
    assert_eq!(store.dirty_versions(obj), vec![(2, DirtyState::DelStable)]);
    assert!(store.clean_entry(obj).is_some());

    // A plain read must resolve the deletion, not the stale clean
    // bytes behind it.
    let out = read(&mut store, obj, 0, BLOCK_SIZE);
    assert_eq!(out.retval, BLOCK_SIZE as i64);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0x00)]);

    // Advance until the tombstone write has landed but its fdatasync
    // has not: DEL_MOVED with the clean entry still in place.
    for _ in 0..64 {
        if store.dirty_versions(obj) == vec![(2, DirtyState::DelMoved)] {
            break;
        }
        store.run_one();
    }
    assert_eq!(store.dirty_versions(obj), vec![(2, DirtyState::DelMoved)]);
    assert!(store.clean_entry(obj).is_some());

    let out = read(&mut store, obj, 0, BLOCK_SIZE);
    assert_eq!(out.retval, BLOCK_SIZE as i64);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0x00)]);
    let out = read_dirty(&mut store, obj, 0, BLOCK_SIZE);
    assert_filled(&out.data, &[(0, BLOCK_SIZE as usize, 0x00)]);

    store.run_until_idle();
    assert!(store.clean_entry(obj).is_none());
    assert!(store.dirty_versions(obj).is_empty());
    assert_eq!(store.data_allocator().allocated_count(), 0);
}

#[test]
fn journal_full_write_parks_until_trim() {
    // Small journal: capacity 15.5 KiB after the header sector.
    let cfg = config_with(16 * 1024, 32);
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(5, 0);

    // Fill most of the journal with journaled writes.
    for version in 1..=3u64 {
        assert_eq!(
            write(&mut store, obj, version, 0, &vec![version as u8; 4096]).retval,
            4096
        );
    }
    assert_eq!(sync(&mut store).retval, 0);

    // Stabilize, stopping as soon as its callback fires so movement
    // has not trimmed anything yet.
    let (slot, cb) = capture();
    store.enqueue(
        stripestore_engine::OpPayload::Stabilize {
            versions: vec![ver(obj, 1), ver(obj, 2), ver(obj, 3)],
        },
        cb,
    );
    assert_eq!(pump(&mut store, &slot).unwrap().retval, 0);

    // The next journaled write does not fit and parks.
    let (wslot, wcb) = capture();
    store.enqueue(
        stripestore_engine::OpPayload::Write {
            oid: obj,
            version: 4,
            offset: 0,
            len: 4096,
            data: bytes::Bytes::from(vec![0x44; 4096]),
        },
        wcb,
    );
    store.run_one();
    assert!(wslot.borrow().is_none());
    assert!(matches!(store.head_wait(), Some(WaitReason::Journal { .. })));
    assert!(store.stats().wait_journal >= 1);

    // Movement trims the journal; the parked write resumes.
    let out = pump(&mut store, &wslot).expect("parked write must resume");
    assert_eq!(out.retval, 4096);
    assert!(store.stats().journal_trims >= 1);

    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 4)]).retval, 0);
    store.run_until_idle();
    let out = read(&mut store, obj, 0, 4096);
    assert_filled(&out.data, &[(0, 4096, 0x44)]);
}

#[test]
fn sector_buffer_exhaustion_parks_writer() {
    let cfg = config_with(64 * 1024, 2);
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(6, 0);

    // 9 entries fit a sector; with 2 buffers the 19th append in one
    // dispatch pass finds every buffer still waiting on its write.
    let mut slots = Vec::new();
    for version in 1..=19u64 {
        let (slot, cb) = capture();
        store.enqueue(
            stripestore_engine::OpPayload::Write {
                oid: obj,
                version,
                offset: 0,
                len: 512,
                data: bytes::Bytes::from(vec![version as u8; 512]),
            },
            cb,
        );
        slots.push(slot);
    }
    store.run_until_idle();

    assert!(store.stats().wait_journal_buffer >= 1);
    for slot in &slots {
        assert_eq!(slot.borrow_mut().take().unwrap().retval, 512);
    }
}

#[test]
fn read_stalls_on_in_flight_version() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(7, 0);

    // Enqueue a write and a read back-to-back: the read dispatches
    // while the write's I/O has not completed and must stall.
    let (wslot, wcb) = capture();
    store.enqueue(
        stripestore_engine::OpPayload::Write {
            oid: obj,
            version: 1,
            offset: 0,
            len: 4096,
            data: bytes::Bytes::from(vec![0x77; 4096]),
        },
        wcb,
    );
    let (rslot, rcb) = capture();
    store.enqueue(
        stripestore_engine::OpPayload::Read {
            oid: obj,
            offset: 0,
            len: 4096,
            dirty: true,
        },
        rcb,
    );

    store.run_one();
    assert!(wslot.borrow().is_some() || rslot.borrow().is_none());
    assert!(store.stats().wait_in_flight >= 1);

    let out = pump(&mut store, &rslot).expect("stalled read must resume");
    assert_eq!(out.retval, 4096);
    assert_filled(&out.data, &[(0, 4096, 0x77)]);
}

#[test]
fn stabilize_error_surfaces() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(8, 0);

    // Unknown version.
    let out = stabilize(&mut store, &[ver(obj, 9)]);
    assert_eq!(out.retval, -i64::from(libc::ENOENT));

    // Written but unsynced version.
    assert_eq!(write(&mut store, obj, 1, 0, &vec![0x55; 512]).retval, 512);
    let out = stabilize(&mut store, &[ver(obj, 1)]);
    assert_eq!(out.retval, -i64::from(libc::EBUSY));

    // Synced: succeeds, and repeating it is a no-op success.
    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
    store.run_until_idle();
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
}

#[test]
fn rollback_discards_unstable_version() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let obj = oid(9, 0);

    put_stable(&mut store, obj, 1, 0, &vec![0x10; 4096]);

    assert_eq!(write(&mut store, obj, 2, 0, &vec![0x20; 4096]).retval, 4096);
    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(rollback(&mut store, &[ver(obj, 2)]).retval, 0);

    assert_eq!(store.dirty_versions(obj), vec![]);
    let out = read_dirty(&mut store, obj, 0, 4096);
    assert_filled(&out.data, &[(0, 4096, 0x10)]);

    // A stable version refuses to roll back.
    let out = rollback(&mut store, &[ver(obj, 1)]);
    assert_eq!(out.retval, -i64::from(libc::ENOENT));

    // The discarded version number may be assigned again.
    assert_eq!(write(&mut store, obj, 2, 0, &vec![0x22; 4096]).retval, 4096);
}

#[test]
fn big_write_no_space() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let block = vec![0x99; BLOCK_SIZE as usize];

    for i in 0..DATA_BLOCKS {
        assert_eq!(
            write(&mut store, oid(10, i << 4), 1, 0, &block).retval,
            BLOCK_SIZE as i64
        );
    }
    let out = write(&mut store, oid(10, DATA_BLOCKS << 4), 1, 0, &block);
    assert_eq!(out.retval, -i64::from(libc::ENOSPC));
    // The failed write leaves no dirty residue.
    assert!(store.dirty_versions(oid(10, DATA_BLOCKS << 4)).is_empty());
}

#[test]
fn allocator_tracks_exactly_live_blocks() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);

    // An in-flight big write holds its block before any metadata
    // exists for it.
    let obj = oid(11, 0);
    assert_eq!(
        write(&mut store, obj, 1, 0, &vec![0x42; BLOCK_SIZE as usize]).retval,
        BLOCK_SIZE as i64
    );
    assert_eq!(store.data_allocator().allocated_count(), 1);
    assert!(store.clean_entry(obj).is_none());

    // After commit the block belongs to the clean entry.
    assert_eq!(sync(&mut store).retval, 0);
    assert_eq!(stabilize(&mut store, &[ver(obj, 1)]).retval, 0);
    store.run_until_idle();
    assert_eq!(store.data_allocator().allocated_count(), 1);
    let clean_block = store.clean_entry(obj).unwrap().block;
    let allocated: Vec<u64> = store.data_allocator().allocated_blocks().collect();
    assert_eq!(allocated, vec![clean_block]);

    // Rewriting the object swaps blocks without leaking the old one.
    put_stable(&mut store, obj, 2, 0, &vec![0x43; BLOCK_SIZE as usize]);
    assert_eq!(store.data_allocator().allocated_count(), 1);
}

#[test]
fn file_backed_store_smoke() {
    use std::collections::HashMap;
    use stripestore_common::StoreConfig;
    use stripestore_engine::{Blockstore, FileBackend, RawFile, RingBackend};

    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.img");
    let journal = dir.path().join("journal.img");
    RawFile::create(&data, DATA_BLOCKS * u64::from(BLOCK_SIZE)).unwrap();
    RawFile::create(&journal, 128 * 1024).unwrap();

    let mut map = HashMap::new();
    map.insert("data_device".to_string(), data.display().to_string());
    map.insert("meta_device".to_string(), journal.display().to_string());
    map.insert("journal_device".to_string(), journal.display().to_string());
    map.insert("block_size".to_string(), BLOCK_SIZE.to_string());
    map.insert("journal_len".to_string(), (64 * 1024).to_string());
    map.insert("meta_offset".to_string(), (64 * 1024).to_string());
    let cfg = StoreConfig::from_map(&map).unwrap();

    let open_backend = || -> Box<dyn RingBackend> {
        Box::new(FileBackend::open(&data, &journal, &journal).unwrap())
    };
    Blockstore::format(&cfg, &mut *open_backend()).unwrap();

    let obj = oid(20, 0);
    {
        let mut store =
            Blockstore::open_with_backend(cfg.clone(), open_backend(), RING_DEPTH).unwrap();
        put_stable(&mut store, obj, 1, 0, &vec![0x5A; 4096]);
        let out = read(&mut store, obj, 0, 4096);
        assert_filled(&out.data, &[(0, 4096, 0x5A)]);
    }

    // Committed state survives a real reopen from disk.
    let mut store = Blockstore::open_with_backend(cfg, open_backend(), RING_DEPTH).unwrap();
    assert_eq!(store.clean_entry(obj).unwrap().version, 1);
    let out = read(&mut store, obj, 0, 4096);
    assert_filled(&out.data, &[(0, 4096, 0x5A)]);
}

#[test]
fn list_objects_reports_stability() {
    let cfg = config();
    let (mut store, _handle) = new_store(&cfg);
    let a = oid(12, 0);
    let b = oid(12, 1 << 4);

    put_stable(&mut store, a, 1, 0, &vec![1; 4096]);
    assert_eq!(write(&mut store, b, 1, 0, &vec![2; 4096]).retval, 4096);

    let listed = store.list_objects();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0], (ver(a, 1), true));
    assert_eq!(listed[1], (ver(b, 1), false));
}
