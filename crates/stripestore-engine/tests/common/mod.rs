//! Shared harness for engine integration tests: a memory-backed store
//! with crash simulation, and blocking wrappers around the async op
//! interface.

#![allow(dead_code)]

use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use stripestore_common::{ObjVer, ObjectId, StoreConfig};
use stripestore_engine::{Blockstore, MemBackend, MemHandle, OpCallback, OpPayload, OpResult};

pub const BLOCK_SIZE: u32 = 8192;
pub const DATA_BLOCKS: u64 = 32;
pub const RING_DEPTH: usize = 64;

pub fn config() -> StoreConfig {
    config_with(64 * 1024, 32)
}

pub fn config_with(journal_len: u64, sector_buffers: usize) -> StoreConfig {
    let mut map = HashMap::new();
    map.insert("data_device".to_string(), "mem:data".to_string());
    map.insert("meta_device".to_string(), "mem:meta".to_string());
    map.insert("journal_device".to_string(), "mem:journal".to_string());
    map.insert("block_size".to_string(), BLOCK_SIZE.to_string());
    map.insert("journal_len".to_string(), journal_len.to_string());
    map.insert(
        "journal_sector_buffer_count".to_string(),
        sector_buffers.to_string(),
    );
    StoreConfig::from_map(&map).unwrap()
}

/// Format fresh memory devices and open a store over them.
pub fn new_store(cfg: &StoreConfig) -> (Blockstore, MemHandle) {
    let mut backend = MemBackend::new(
        (DATA_BLOCKS * u64::from(BLOCK_SIZE)) as usize,
        4096,
        cfg.journal_len as usize,
    );
    Blockstore::format(cfg, &mut backend).unwrap();
    let handle = backend.handle();
    let store = Blockstore::open_with_backend(cfg.clone(), Box::new(backend), RING_DEPTH).unwrap();
    (store, handle)
}

/// Simulate power loss: reopen a store over the durable images only.
pub fn crash_reopen(cfg: &StoreConfig, handle: &MemHandle) -> (Blockstore, MemHandle) {
    let backend = handle.crash_and_reopen();
    let new_handle = backend.handle();
    let store = Blockstore::open_with_backend(cfg.clone(), Box::new(backend), RING_DEPTH).unwrap();
    (store, new_handle)
}

pub type ResultSlot = Rc<RefCell<Option<OpResult>>>;

pub fn capture() -> (ResultSlot, OpCallback) {
    let slot: ResultSlot = Rc::new(RefCell::new(None));
    let inner = Rc::clone(&slot);
    (
        slot,
        Box::new(move |r| {
            *inner.borrow_mut() = Some(r);
        }),
    )
}

pub fn oid(inode: u64, stripe: u64) -> ObjectId {
    ObjectId::new(inode, stripe)
}

pub fn ver(oid: ObjectId, version: u64) -> ObjVer {
    ObjVer::new(oid, version)
}

/// Pump the loop until the slot fills (op completed) or no progress
/// remains (op parked).
pub fn pump(store: &mut Blockstore, slot: &ResultSlot) -> Option<OpResult> {
    loop {
        if slot.borrow().is_some() {
            return slot.borrow_mut().take();
        }
        if !store.run_one() {
            return slot.borrow_mut().take();
        }
    }
}

pub fn write(
    store: &mut Blockstore,
    oid: ObjectId,
    version: u64,
    offset: u32,
    data: &[u8],
) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(
        OpPayload::Write {
            oid,
            version,
            offset,
            len: data.len() as u32,
            data: Bytes::copy_from_slice(data),
        },
        cb,
    );
    pump(store, &slot).expect("write did not complete")
}

pub fn delete(store: &mut Blockstore, oid: ObjectId, version: u64) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(OpPayload::Delete { oid, version }, cb);
    pump(store, &slot).expect("delete did not complete")
}

pub fn read(store: &mut Blockstore, oid: ObjectId, offset: u32, len: u32) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(
        OpPayload::Read {
            oid,
            offset,
            len,
            dirty: false,
        },
        cb,
    );
    pump(store, &slot).expect("read did not complete")
}

pub fn read_dirty(store: &mut Blockstore, oid: ObjectId, offset: u32, len: u32) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(
        OpPayload::Read {
            oid,
            offset,
            len,
            dirty: true,
        },
        cb,
    );
    pump(store, &slot).expect("dirty read did not complete")
}

pub fn sync(store: &mut Blockstore) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(OpPayload::Sync, cb);
    pump(store, &slot).expect("sync did not complete")
}

pub fn stabilize(store: &mut Blockstore, versions: &[ObjVer]) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(
        OpPayload::Stabilize {
            versions: versions.to_vec(),
        },
        cb,
    );
    pump(store, &slot).expect("stabilize did not complete")
}

pub fn rollback(store: &mut Blockstore, versions: &[ObjVer]) -> OpResult {
    let (slot, cb) = capture();
    store.enqueue(
        OpPayload::Rollback {
            versions: versions.to_vec(),
        },
        cb,
    );
    pump(store, &slot).expect("rollback did not complete")
}

/// Write, sync and stabilize one version, driving everything to idle.
pub fn put_stable(store: &mut Blockstore, oid: ObjectId, version: u64, offset: u32, data: &[u8]) {
    assert_eq!(
        write(store, oid, version, offset, data).retval,
        data.len() as i64
    );
    assert_eq!(sync(store).retval, 0);
    assert_eq!(stabilize(store, &[ver(oid, version)]).retval, 0);
    store.run_until_idle();
}

pub fn assert_filled(buf: &[u8], ranges: &[(usize, usize, u8)]) {
    for &(start, end, value) in ranges {
        for (i, &b) in buf[start..end].iter().enumerate() {
            assert_eq!(
                b,
                value,
                "byte {} expected {value:#04x} got {b:#04x}",
                start + i
            );
        }
    }
}
