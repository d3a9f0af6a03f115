//! The blockstore composite
//!
//! [`Blockstore`] owns the version indexes, the data-region allocator,
//! the journal writer, the metadata image and the submission ring, and
//! drives everything from one cooperative event loop. Callers enqueue
//! operations and pump [`Blockstore::run_one`]; device completions
//! advance per-version state machines and fire operation callbacks on
//! this loop.
//!
//! Dispatch is strictly head-of-line: when the queue head cannot get
//! the resources it needs, nothing behind it is attempted. This is
//! intentional - it keeps a flood of writes from starving scatter
//! reads of submission slots.

use crate::alloc::BlockBitmap;
use crate::flush::{HeadJob, MoveJob};
use crate::journal::Journal;
use crate::layout::{CLEAN_ENTRY_SIZE, SECTOR_SIZE};
use crate::op::{
    BlockstoreOp, Dispatch, IoPurpose, IoTicket, OpCallback, OpPayload, OpResult, WaitReason,
};
use crate::ring::{Completion, Device, FileBackend, IoCmd, Ring, RingBackend};
use std::collections::{BTreeMap, HashMap, VecDeque};
use stripestore_common::{Error, ObjVer, ObjectId, Result, StoreConfig};
use tracing::{debug, info, warn};

/// Default submission ring depth for [`Blockstore::open`].
pub const DEFAULT_RING_DEPTH: usize = 256;

/// How a version reaches durability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Partial-block write journaled as entry + payload.
    Small,
    /// Full-block write redirected to a fresh data block.
    Big,
    /// Deletion, journaled as an entry.
    Delete,
}

/// Lifecycle state of a dirty (not yet committed) version.
///
/// States are never stored on disk; they are deduced from the journal
/// on recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyState {
    /// Created at enqueue; initial device writes not yet complete.
    InFlight,
    // Small (journaled) writes.
    JWritten,
    JSynced,
    JStable,
    JMoved,
    JMoveSynced,
    // Big (redirect) writes.
    DWritten,
    DSynced,
    DMetaWritten,
    DMetaSynced,
    DStable,
    DMetaMoved,
    DMetaCommitted,
    // Deletions.
    DelWritten,
    DelSynced,
    DelStable,
    DelMoved,
}

impl DirtyState {
    /// Durable and immune to crash loss.
    ///
    /// DEL_MOVED is included: while its tombstone fdatasync is still in
    /// flight the old clean entry is present, and plain reads must keep
    /// resolving the deletion over it until promotion retires both.
    #[must_use]
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            Self::JStable
                | Self::JMoved
                | Self::JMoveSynced
                | Self::DStable
                | Self::DMetaMoved
                | Self::DMetaCommitted
                | Self::DelSynced
                | Self::DelStable
                | Self::DelMoved
        )
    }

    /// Reached the durability barrier (eligible for stabilize).
    #[must_use]
    pub fn is_synced(self) -> bool {
        !matches!(
            self,
            Self::InFlight | Self::JWritten | Self::DWritten | Self::DMetaWritten | Self::DelWritten
        )
    }

    /// States whose bytes read as zeros. Covers the whole deletion
    /// lifecycle: DEL_STABLE waits in the flush queue and, like every
    /// deletion state, has no payload a reader could fetch.
    #[must_use]
    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::DelWritten | Self::DelSynced | Self::DelStable | Self::DelMoved
        )
    }
}

/// Committed version of an object: one per object, data in the data
/// region, recorded in the metadata table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanEntry {
    pub version: u64,
    /// Data-region block index (also the metadata slot index).
    pub block: u64,
}

/// A version still traversing the journal/data lifecycle.
#[derive(Clone, Copy, Debug)]
pub struct DirtyEntry {
    pub state: DirtyState,
    pub kind: WriteKind,
    /// Byte offset of the payload: journal-region-relative for small
    /// writes, data-region-relative for big writes.
    pub location: u64,
    /// Byte range covered within the object block.
    pub offset: u32,
    pub len: u32,
    /// Ring offset of the journal sector holding this version's entry.
    /// Blocks trim until the version is moved.
    pub journal_block: Option<u64>,
}

/// Derived region geometry.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub block_count: u64,
    pub data_len: u64,
    pub meta_len: u64,
}

/// Event-loop and resource counters.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub syncs: u64,
    pub stabilizes: u64,
    pub rollbacks: u64,
    pub wait_sqe: u64,
    pub wait_in_flight: u64,
    pub wait_journal: u64,
    pub wait_journal_buffer: u64,
    pub journal_trims: u64,
    pub versions_moved: u64,
}

/// The single-node blockstore engine.
pub struct Blockstore {
    pub(crate) cfg: StoreConfig,
    pub(crate) geo: Geometry,
    pub(crate) ring: Ring,

    pub(crate) ops: HashMap<u64, BlockstoreOp>,
    pub(crate) moves: HashMap<u64, MoveJob>,
    pub(crate) head_job: Option<HeadJob>,
    pub(crate) head_redo: bool,
    pub(crate) tickets: HashMap<u64, IoTicket>,
    pub(crate) next_id: u64,
    pub(crate) next_token: u64,
    pub(crate) submit_queue: VecDeque<u64>,

    pub(crate) clean: BTreeMap<ObjectId, CleanEntry>,
    pub(crate) dirty: BTreeMap<ObjVer, DirtyEntry>,
    pub(crate) data_alloc: BlockBitmap,
    pub(crate) journal: Journal,
    pub(crate) meta_image: Vec<u8>,

    pub(crate) unsynced_big: Vec<ObjVer>,
    pub(crate) unsynced_small: Vec<ObjVer>,
    pub(crate) flush_queue: VecDeque<ObjVer>,
    pub(crate) read_pins: BTreeMap<u64, u32>,

    pub(crate) inode_stats: BTreeMap<u64, u64>,
    pub(crate) stats: StoreStats,
    pub(crate) in_callback: bool,
}

impl Blockstore {
    /// Open the devices named by the configuration and recover.
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        let backend = FileBackend::open(&cfg.data_device, &cfg.meta_device, &cfg.journal_device)?;
        Self::open_with_backend(cfg, Box::new(backend), DEFAULT_RING_DEPTH)
    }

    /// Open over an explicit backend (simulated devices in tests, or a
    /// custom ring depth).
    pub fn open_with_backend(
        cfg: StoreConfig,
        backend: Box<dyn RingBackend>,
        ring_depth: usize,
    ) -> Result<Self> {
        cfg.validate()?;
        let ring = Ring::new(backend, ring_depth);
        let geo = Self::calc_geometry(&cfg, &ring)?;

        let mut store = Self {
            journal: Journal::new(cfg.journal_len, cfg.journal_sector_buffer_count),
            data_alloc: BlockBitmap::new(geo.block_count),
            meta_image: vec![0u8; geo.meta_len as usize],
            cfg,
            geo,
            ring,
            ops: HashMap::new(),
            moves: HashMap::new(),
            head_job: None,
            head_redo: false,
            tickets: HashMap::new(),
            next_id: 1,
            next_token: 1,
            submit_queue: VecDeque::new(),
            clean: BTreeMap::new(),
            dirty: BTreeMap::new(),
            unsynced_big: Vec::new(),
            unsynced_small: Vec::new(),
            flush_queue: VecDeque::new(),
            read_pins: BTreeMap::new(),
            inode_stats: BTreeMap::new(),
            stats: StoreStats::default(),
            in_callback: false,
        };
        store.recover()?;
        Ok(store)
    }

    /// Initialize fresh on-disk state: journal header at the region
    /// start, an empty first data sector, and a zeroed metadata table.
    pub fn format(cfg: &StoreConfig, backend: &mut dyn RingBackend) -> Result<()> {
        cfg.validate()?;
        let header = crate::layout::JournalHeader {
            start_offset: SECTOR_SIZE as u64,
            start_crc32: 0,
        };
        backend.run(IoCmd::Write {
            dev: Device::Journal,
            offset: cfg.journal_offset,
            data: header.to_sector(),
        })?;
        // Zero the first data sector so recovery of a freshly formatted
        // store stops immediately instead of chasing stale entries from
        // a previous generation.
        backend.run(IoCmd::Write {
            dev: Device::Journal,
            offset: cfg.journal_offset + SECTOR_SIZE as u64,
            data: bytes::Bytes::from(vec![0u8; SECTOR_SIZE]),
        })?;
        backend.run(IoCmd::Fdatasync {
            dev: Device::Journal,
        })?;

        // Zero the metadata table.
        let data_len = backend
            .device_len(Device::Data)
            .checked_sub(cfg.data_offset)
            .ok_or_else(|| Error::config("data_offset past end of device"))?;
        let block_count = data_len >> cfg.block_order;
        let meta_len = round_up(block_count * CLEAN_ENTRY_SIZE as u64, SECTOR_SIZE as u64);
        let chunk = 64 * 1024;
        let mut off = 0u64;
        while off < meta_len {
            let n = chunk.min(meta_len - off);
            backend.run(IoCmd::Write {
                dev: Device::Meta,
                offset: cfg.meta_offset + off,
                data: bytes::Bytes::from(vec![0u8; n as usize]),
            })?;
            off += n;
        }
        backend.run(IoCmd::Fdatasync { dev: Device::Meta })?;
        info!(
            blocks = block_count,
            journal_len = cfg.journal_len,
            "formatted store"
        );
        Ok(())
    }

    fn calc_geometry(cfg: &StoreConfig, ring: &Ring) -> Result<Geometry> {
        let data_len = ring
            .device_len(Device::Data)
            .checked_sub(cfg.data_offset)
            .filter(|&l| l >= u64::from(cfg.block_size))
            .ok_or_else(|| Error::config("data region smaller than one block"))?;
        let block_count = data_len >> cfg.block_order;
        let meta_len = round_up(block_count * CLEAN_ENTRY_SIZE as u64, SECTOR_SIZE as u64);

        if cfg.meta_offset + meta_len > ring.device_len(Device::Meta) {
            return Err(Error::config("metadata region does not fit its device"));
        }
        if cfg.journal_offset + cfg.journal_len > ring.device_len(Device::Journal) {
            return Err(Error::config("journal region does not fit its device"));
        }

        let regions = [
            (&cfg.data_device, cfg.data_offset, data_len),
            (&cfg.meta_device, cfg.meta_offset, meta_len),
            (&cfg.journal_device, cfg.journal_offset, cfg.journal_len),
        ];
        for i in 0..regions.len() {
            for j in i + 1..regions.len() {
                let (dev_a, off_a, len_a) = regions[i];
                let (dev_b, off_b, len_b) = regions[j];
                if dev_a == dev_b && off_a < off_b + len_b && off_b < off_a + len_a {
                    return Err(Error::config("regions overlap on a shared device"));
                }
            }
        }

        Ok(Geometry {
            block_count,
            data_len,
            meta_len,
        })
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Enqueue an operation. Validation failures complete the op inline
    /// through its callback with a negative retval. Returns the op id.
    pub fn enqueue(&mut self, payload: OpPayload, callback: OpCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let mut op = BlockstoreOp::new(payload, callback);
        match self.admit(&mut op) {
            Ok(()) => {
                self.ops.insert(id, op);
                self.submit_queue.push_back(id);
            }
            Err(e) => {
                debug!(op = id, error = %e, "rejected at enqueue");
                op.retval = e.retval();
                self.complete_op(op);
            }
        }
        id
    }

    /// Validate an op and record its dirty entry, so that reads and
    /// syncs enqueued afterwards observe the version immediately.
    fn admit(&mut self, op: &mut BlockstoreOp) -> Result<()> {
        match &op.payload {
            OpPayload::Read { offset, len, .. } => {
                self.stats.reads += 1;
                self.check_range(*offset, *len)?;
                Ok(())
            }
            OpPayload::Write {
                oid,
                version,
                offset,
                len,
                data,
            } => {
                self.stats.writes += 1;
                self.check_range(*offset, *len)?;
                if data.len() != *len as usize {
                    return Err(Error::invalid("buffer length does not match len"));
                }
                let kind = if *len == self.cfg.block_size {
                    WriteKind::Big
                } else {
                    WriteKind::Small
                };
                self.check_version(*oid, *version)?;
                op.result_version = *version;
                self.dirty.insert(
                    ObjVer::new(*oid, *version),
                    DirtyEntry {
                        state: DirtyState::InFlight,
                        kind,
                        location: 0,
                        offset: *offset,
                        len: *len,
                        journal_block: None,
                    },
                );
                Ok(())
            }
            OpPayload::Delete { oid, version } => {
                self.stats.deletes += 1;
                self.check_version(*oid, *version)?;
                op.result_version = *version;
                // A deletion masks the whole block for readers.
                self.dirty.insert(
                    ObjVer::new(*oid, *version),
                    DirtyEntry {
                        state: DirtyState::InFlight,
                        kind: WriteKind::Delete,
                        location: 0,
                        offset: 0,
                        len: self.cfg.block_size,
                        journal_block: None,
                    },
                );
                Ok(())
            }
            OpPayload::Sync => {
                self.stats.syncs += 1;
                Ok(())
            }
            OpPayload::Stabilize { .. } => {
                self.stats.stabilizes += 1;
                Ok(())
            }
            OpPayload::Rollback { .. } => {
                self.stats.rollbacks += 1;
                Ok(())
            }
        }
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<()> {
        let align = self.cfg.disk_alignment;
        if len == 0 {
            return Err(Error::invalid("zero-length range"));
        }
        if offset % align != 0 || len % align != 0 {
            return Err(Error::invalid("offset and len must be aligned"));
        }
        if u64::from(offset) + u64::from(len) > u64::from(self.cfg.block_size) {
            return Err(Error::invalid("range exceeds object block"));
        }
        Ok(())
    }

    /// Versions are chosen by the caller and must grow strictly.
    fn check_version(&self, oid: ObjectId, version: u64) -> Result<()> {
        if version == 0 {
            return Err(Error::invalid("version 0 is reserved"));
        }
        let mut max = self.clean.get(&oid).map(|c| c.version).unwrap_or(0);
        if let Some((ov, _)) = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .next_back()
        {
            max = max.max(ov.version);
        }
        if version <= max {
            return Err(Error::invalid(format!(
                "version {version} is not above current {max} for {oid}"
            )));
        }
        Ok(())
    }

    // ── Event loop ─────────────────────────────────────────────────────────

    /// One pass of the event loop: dispatch the queue, advance the
    /// flusher, submit staged I/O and handle completions. Returns
    /// whether any progress was made.
    pub fn run_one(&mut self) -> bool {
        debug_assert!(!self.in_callback, "event loop re-entered from a callback");
        let mut progress = self.dispatch_queue();
        if self.run_flusher() {
            progress = true;
        }
        if self.ring.submit() > 0 {
            progress = true;
        }
        while let Some(c) = self.ring.poll() {
            self.handle_completion(c);
            progress = true;
        }
        progress
    }

    /// Pump the loop until no more progress is possible (all ops
    /// finished or parked on unsatisfiable waits).
    pub fn run_until_idle(&mut self) {
        while self.run_one() {}
    }

    fn dispatch_queue(&mut self) -> bool {
        let mut progress = false;
        loop {
            let Some(&id) = self.submit_queue.front() else {
                break;
            };
            if !self.ops.contains_key(&id) {
                // Finished by a completion while still queued.
                self.submit_queue.pop_front();
                progress = true;
                continue;
            }
            if let Some(reason) = self.ops[&id].wait_for {
                if self.wait_satisfied(&reason) {
                    self.ops.get_mut(&id).unwrap().wait_for = None;
                } else {
                    break;
                }
            }

            let staged_before = self.ring.stage_mark();
            let outcome = self.dispatch(id);
            if self.ring.stage_mark() != staged_before {
                progress = true;
            }
            match outcome {
                Dispatch::Finished | Dispatch::Submitted => {
                    self.submit_queue.pop_front();
                    progress = true;
                }
                Dispatch::Pending => break,
                Dispatch::Wait(reason) => {
                    self.note_wait(&reason);
                    self.ops.get_mut(&id).unwrap().wait_for = Some(reason);
                    break;
                }
            }
        }
        progress
    }

    fn dispatch(&mut self, id: u64) -> Dispatch {
        match &self.ops[&id].payload {
            OpPayload::Read { .. } => self.dequeue_read(id),
            OpPayload::Write { .. } => self.dequeue_write(id),
            OpPayload::Delete { .. } => self.dequeue_delete(id),
            OpPayload::Sync => self.dequeue_sync(id),
            OpPayload::Stabilize { .. } => self.dequeue_stable(id),
            OpPayload::Rollback { .. } => self.dequeue_rollback(id),
        }
    }

    fn wait_satisfied(&self, reason: &WaitReason) -> bool {
        match reason {
            WaitReason::Sqe => self.ring.free_slots() > 0,
            WaitReason::InFlight { oid, version } => self
                .dirty
                .get(&ObjVer::new(*oid, *version))
                .map(|d| d.state != DirtyState::InFlight)
                .unwrap_or(true),
            WaitReason::Journal { need } => self.journal.free_bytes() >= *need,
            WaitReason::JournalBuffer => self.journal.next_buffer_free(),
        }
    }

    fn note_wait(&mut self, reason: &WaitReason) {
        match reason {
            WaitReason::Sqe => self.stats.wait_sqe += 1,
            WaitReason::InFlight { .. } => self.stats.wait_in_flight += 1,
            WaitReason::Journal { .. } => self.stats.wait_journal += 1,
            WaitReason::JournalBuffer => self.stats.wait_journal_buffer += 1,
        }
    }

    // ── Completion plumbing ────────────────────────────────────────────────

    fn handle_completion(&mut self, c: Completion) {
        let Some(ticket) = self.tickets.remove(&c.token) else {
            warn!(token = c.token, "completion without a ticket");
            return;
        };
        match ticket.purpose {
            IoPurpose::ReadChunk { buf_off } => self.on_read_chunk(ticket.owner, buf_off, c.result),
            IoPurpose::WriteData => self.on_big_write_done(ticket.owner, c.result),
            IoPurpose::WriteJournalSector { sector } => {
                self.journal.decrement_usage(sector as usize);
                self.on_journal_write_done(ticket.owner, c.result)
            }
            IoPurpose::WriteJournalPayload => self.on_journal_write_done(ticket.owner, c.result),
            IoPurpose::DataFsync => self.on_data_fsync_done(ticket.owner, c.result),
            IoPurpose::JournalFsync => self.on_journal_fsync_done(ticket.owner, c.result),
            IoPurpose::MoveRead
            | IoPurpose::MoveReadBase
            | IoPurpose::MoveWrite
            | IoPurpose::MoveDataFsync
            | IoPurpose::MoveMetaWrite
            | IoPurpose::MoveMetaFsync => self.on_move_io(ticket.owner, ticket.purpose, c.result),
            IoPurpose::HeadWrite | IoPurpose::HeadFsync => {
                self.on_head_io(ticket.purpose, c.result)
            }
        }
    }

    /// Stage one submission owned by `owner`. Returns false when the
    /// ring is full.
    pub(crate) fn stage_io(&mut self, cmd: IoCmd, owner: u64, purpose: IoPurpose) -> bool {
        let token = self.next_token;
        if !self.ring.stage(token, cmd) {
            return false;
        }
        self.next_token += 1;
        self.tickets.insert(token, IoTicket { owner, purpose });
        true
    }

    /// Roll back a speculative reservation: drop staged submissions
    /// after `ring_mark` and their tickets.
    pub(crate) fn rollback_staged(&mut self, ring_mark: usize, token_mark: u64) {
        self.ring.unstage_to(ring_mark);
        self.tickets.retain(|&token, _| token < token_mark);
        self.next_token = token_mark;
    }

    /// Complete an op that is still in the arena.
    pub(crate) fn finish_op(&mut self, id: u64) {
        if let Some(op) = self.ops.remove(&id) {
            self.complete_op(op);
        }
    }

    pub(crate) fn fail_op(&mut self, id: u64, err: &Error) {
        if let Some(mut op) = self.ops.remove(&id) {
            op.retval = err.retval();
            self.complete_op(op);
        }
    }

    fn complete_op(&mut self, mut op: BlockstoreOp) {
        for pin in std::mem::take(&mut op.journal_pins) {
            self.release_pin(pin);
        }
        let result = OpResult {
            retval: op.retval,
            version: op.result_version,
            data: std::mem::take(&mut op.buf),
        };
        if let Some(cb) = op.callback.take() {
            debug_assert!(!self.in_callback, "nested op callback");
            self.in_callback = true;
            cb(result);
            self.in_callback = false;
        }
    }

    // ── Reader pins ────────────────────────────────────────────────────────

    pub(crate) fn add_pin(&mut self, offset: u64) {
        *self.read_pins.entry(offset).or_insert(0) += 1;
    }

    pub(crate) fn release_pin(&mut self, offset: u64) {
        if let Some(count) = self.read_pins.get_mut(&offset) {
            *count -= 1;
            if *count == 0 {
                self.read_pins.remove(&offset);
            }
        }
        self.maybe_trim();
    }

    // ── Accessors & diagnostics ────────────────────────────────────────────

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.cfg.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.geo.block_count
    }

    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        self.data_alloc.free_count()
    }

    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn data_allocator(&self) -> &BlockBitmap {
        &self.data_alloc
    }

    #[must_use]
    pub fn clean_entry(&self, oid: ObjectId) -> Option<CleanEntry> {
        self.clean.get(&oid).copied()
    }

    /// Dirty versions of one object with their states, oldest first.
    #[must_use]
    pub fn dirty_versions(&self, oid: ObjectId) -> Vec<(u64, DirtyState)> {
        self.dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .map(|(ov, de)| (ov.version, de.state))
            .collect()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.submit_queue.len()
    }

    /// Wait reason of the queue head, if it is parked.
    #[must_use]
    pub fn head_wait(&self) -> Option<WaitReason> {
        let id = self.submit_queue.front()?;
        self.ops.get(id)?.wait_for
    }

    /// True when no queued ops, in-flight I/O or background movement
    /// remain.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.submit_queue.is_empty()
            && self.ops.is_empty()
            && self.moves.is_empty()
            && self.head_job.is_none()
            && self.flush_queue.is_empty()
    }

    /// Per-inode committed space usage in bytes.
    #[must_use]
    pub fn inode_space_stats(&self) -> &BTreeMap<u64, u64> {
        &self.inode_stats
    }

    /// Enumerate all known object versions. Clean entries report as
    /// stable; dirty versions report their own stability.
    #[must_use]
    pub fn list_objects(&self) -> Vec<(ObjVer, bool)> {
        let mut out: Vec<(ObjVer, bool)> = self
            .clean
            .iter()
            .map(|(oid, ce)| (ObjVer::new(*oid, ce.version), true))
            .collect();
        out.extend(
            self.dirty
                .iter()
                .map(|(ov, de)| (*ov, de.state.is_stable())),
        );
        out.sort();
        out
    }

    /// Log a snapshot of queue, journal and allocator state.
    pub fn dump_diagnostics(&self) {
        info!(
            queue = self.submit_queue.len(),
            ops = self.ops.len(),
            moves = self.moves.len(),
            clean = self.clean.len(),
            dirty = self.dirty.len(),
            journal_used_start = self.journal.used_start,
            journal_next_free = self.journal.next_free,
            journal_free = self.journal.free_bytes(),
            blocks_free = self.data_alloc.free_count(),
            blocks_total = self.data_alloc.total_count(),
            "blockstore state"
        );
    }

    // ── Region offset helpers ──────────────────────────────────────────────

    /// Device offset of a journal-region-relative position.
    #[must_use]
    pub(crate) fn journal_dev_off(&self, rel: u64) -> u64 {
        self.cfg.journal_offset + rel
    }

    /// Device offset of a data-region-relative position.
    #[must_use]
    pub(crate) fn data_dev_off(&self, rel: u64) -> u64 {
        self.cfg.data_offset + rel
    }

    /// Device offset of a metadata-region-relative position.
    #[must_use]
    pub(crate) fn meta_dev_off(&self, rel: u64) -> u64 {
        self.cfg.meta_offset + rel
    }
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::MemBackend;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> StoreConfig {
        let mut map = StdHashMap::new();
        map.insert("data_device".to_string(), "mem:data".to_string());
        map.insert("meta_device".to_string(), "mem:meta".to_string());
        map.insert("journal_device".to_string(), "mem:journal".to_string());
        map.insert("block_size".to_string(), "8192".to_string());
        map.insert("journal_len".to_string(), "65536".to_string());
        StoreConfig::from_map(&map).unwrap()
    }

    fn open_store() -> Blockstore {
        let cfg = test_config();
        let mut backend = MemBackend::new(32 * 8192, 4096, 65536);
        Blockstore::format(&cfg, &mut backend).unwrap();
        Blockstore::open_with_backend(cfg, Box::new(backend), 64).unwrap()
    }

    #[test]
    fn test_open_empty_store() {
        let store = open_store();
        assert_eq!(store.block_size(), 8192);
        assert_eq!(store.block_count(), 32);
        assert_eq!(store.free_block_count(), 32);
        assert!(store.is_idle());
        assert!(store.journal().is_empty());
    }

    #[test]
    fn test_geometry_overlap_rejected() {
        let mut map = StdHashMap::new();
        map.insert("data_device".to_string(), "mem:shared".to_string());
        map.insert("journal_device".to_string(), "mem:shared".to_string());
        map.insert("block_size".to_string(), "8192".to_string());
        map.insert("journal_len".to_string(), "65536".to_string());
        // data_offset defaults to 0 and overlaps the journal at 0.
        let cfg = StoreConfig::from_map(&map).unwrap();
        let backend = MemBackend::new(32 * 8192, 4096, 65536);
        assert!(Blockstore::open_with_backend(cfg, Box::new(backend), 64).is_err());
    }

    #[test]
    fn test_version_monotonicity_enforced() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut store = open_store();
        let oid = ObjectId::new(1, 0);

        let ok = Rc::new(Cell::new(0i64));
        let ok2 = Rc::clone(&ok);
        store.enqueue(
            OpPayload::Write {
                oid,
                version: 5,
                offset: 0,
                len: 512,
                data: bytes::Bytes::from(vec![1u8; 512]),
            },
            Box::new(move |r| ok2.set(r.retval)),
        );
        store.run_until_idle();
        assert_eq!(ok.get(), 512);

        // Same or lower version is rejected inline.
        let bad = Rc::new(Cell::new(0i64));
        let bad2 = Rc::clone(&bad);
        store.enqueue(
            OpPayload::Write {
                oid,
                version: 5,
                offset: 0,
                len: 512,
                data: bytes::Bytes::from(vec![2u8; 512]),
            },
            Box::new(move |r| bad2.set(r.retval)),
        );
        assert_eq!(bad.get(), -i64::from(libc::EINVAL));
    }

    #[test]
    fn test_alignment_enforced() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut store = open_store();
        let rv = Rc::new(Cell::new(0i64));
        let rv2 = Rc::clone(&rv);
        store.enqueue(
            OpPayload::Write {
                oid: ObjectId::new(1, 0),
                version: 1,
                offset: 100,
                len: 512,
                data: bytes::Bytes::from(vec![0u8; 512]),
            },
            Box::new(move |r| rv2.set(r.retval)),
        );
        assert_eq!(rv.get(), -i64::from(libc::EINVAL));
    }
}
