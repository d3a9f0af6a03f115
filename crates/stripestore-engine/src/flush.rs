//! Movement of stable versions and journal trim
//!
//! Stability permits movement: a stable small write is merged over the
//! object's committed block image and written to a fresh data block, a
//! stable big write only needs its metadata committed, a stable delete
//! tombstones its metadata slot. Promotion then replaces the clean
//! entry, retires the old block and erases the superseded dirty
//! entries, which in turn lets the journal trim cursor advance.
//!
//! Every metadata mutation is write-then-fdatasync. Per object, at most
//! one move runs at a time so the merge base stays coherent.

use crate::layout::{encode_clean_entry, JournalHeader, CLEAN_ENTRY_SIZE, SECTOR_SIZE};
use crate::op::IoPurpose;
use crate::ring::{Device, IoCmd, IoOutcome};
use crate::store::{Blockstore, CleanEntry, DirtyState, WriteKind};
use bytes::Bytes;
use std::io;
use stripestore_common::{ObjVer, ObjectId};
use tracing::{debug, trace, warn};

/// Most concurrently moving versions.
const MAX_ACTIVE_MOVES: usize = 4;

/// Next action a move job will stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MovePhase {
    /// Read journal payload (and the clean block as merge base).
    ReadPayload,
    /// Write the composed block to its fresh data block.
    WriteData,
    /// fdatasync the data device.
    SyncData,
    /// Write the affected metadata sectors.
    WriteMeta,
    /// fdatasync the metadata device, then promote.
    SyncMeta,
}

/// One in-progress movement of a stable version.
pub(crate) struct MoveJob {
    pub ov: ObjVer,
    pub kind: WriteKind,
    pub phase: MovePhase,
    /// Journal payload (small writes).
    pub payload: Option<Bytes>,
    /// Committed block content used as merge base (small writes).
    pub base: Option<Bytes>,
    /// Freshly allocated target block (small writes).
    pub new_block: u64,
    /// Clean block being retired, if the object had one.
    pub old_block: Option<u64>,
    pub pending: u32,
    pub failed: bool,
}

/// Journal header rewrite after a trim.
pub(crate) struct HeadJob {
    pub start: u64,
    pub crc: u32,
    pub synced: bool,
    pub pending: u32,
}

impl Blockstore {
    /// Advance stalled jobs and start new ones. Returns whether any
    /// submission was staged or a job retired.
    pub(crate) fn run_flusher(&mut self) -> bool {
        let staged_before = self.ring.stage_mark();
        let mut progress = false;

        let ready: Vec<u64> = self
            .moves
            .iter()
            .filter(|(_, j)| j.pending == 0)
            .map(|(&id, _)| id)
            .collect();
        for id in ready {
            self.continue_move(id);
        }
        if self.head_job.as_ref().is_some_and(|h| h.pending == 0) {
            self.continue_head();
        }

        while self.moves.len() < MAX_ACTIVE_MOVES {
            let Some(ov) = self.flush_queue.pop_front() else {
                break;
            };
            let Some(de) = self.dirty.get(&ov).copied() else {
                // Superseded by a newer promotion meanwhile.
                progress = true;
                continue;
            };
            if !de.state.is_stable() {
                continue;
            }
            if self.moves.values().any(|m| m.ov.oid == ov.oid) {
                // One move per object at a time.
                self.flush_queue.push_back(ov);
                break;
            }

            if de.kind == WriteKind::Delete && !self.clean.contains_key(&ov.oid) {
                // Nothing committed to tombstone; retire in place.
                self.promote(ov, WriteKind::Delete, None);
                progress = true;
                continue;
            }

            let id = self.next_id;
            self.next_id += 1;
            let phase = match de.kind {
                WriteKind::Small => MovePhase::ReadPayload,
                WriteKind::Big | WriteKind::Delete => MovePhase::WriteMeta,
            };
            self.moves.insert(
                id,
                MoveJob {
                    ov,
                    kind: de.kind,
                    phase,
                    payload: None,
                    base: None,
                    new_block: match de.kind {
                        WriteKind::Big => de.location >> self.cfg.block_order,
                        _ => 0,
                    },
                    old_block: self.clean.get(&ov.oid).map(|c| c.block),
                    pending: 0,
                    failed: false,
                },
            );
            trace!(%ov, job = id, "movement started");
            self.continue_move(id);
            progress = true;
        }

        progress || self.ring.stage_mark() != staged_before
    }

    /// Stage the current phase of a job whose previous I/Os completed.
    /// Safe to call repeatedly; a phase that cannot get its submission
    /// slots simply stays put and is retried on the next pass.
    fn continue_move(&mut self, id: u64) {
        let Some(job) = self.moves.get(&id) else {
            return;
        };
        if job.pending > 0 {
            return;
        }
        if job.failed {
            let ov = job.ov;
            warn!(%ov, "movement abandoned after I/O error");
            self.moves.remove(&id);
            return;
        }
        let (ov, phase, old_block) = (job.ov, job.phase, job.old_block);

        match phase {
            MovePhase::ReadPayload => {
                let Some(de) = self.dirty.get(&ov).copied() else {
                    self.moves.remove(&id);
                    return;
                };
                let needed = 1 + usize::from(old_block.is_some());
                if self.ring.free_slots() < needed {
                    return;
                }
                self.stage_io(
                    IoCmd::Read {
                        dev: Device::Journal,
                        offset: self.journal_dev_off(de.location),
                        len: de.len,
                    },
                    id,
                    IoPurpose::MoveRead,
                );
                if let Some(block) = old_block {
                    self.stage_io(
                        IoCmd::Read {
                            dev: Device::Data,
                            offset: self.data_dev_off(block << self.cfg.block_order),
                            len: self.cfg.block_size,
                        },
                        id,
                        IoPurpose::MoveReadBase,
                    );
                }
                self.moves.get_mut(&id).unwrap().pending = needed as u32;
            }
            MovePhase::WriteData => {
                if self.ring.free_slots() < 1 {
                    return;
                }
                let Some(de) = self.dirty.get(&ov).copied() else {
                    self.moves.remove(&id);
                    return;
                };
                let Some(block) = self.data_alloc.allocate() else {
                    warn!(%ov, "no free block for movement, retrying later");
                    self.moves.remove(&id);
                    self.flush_queue.push_back(ov);
                    return;
                };
                let job = self.moves.get_mut(&id).unwrap();
                job.new_block = block;

                let mut composed = match job.base.take() {
                    Some(base) => base.to_vec(),
                    None => vec![0u8; self.cfg.block_size as usize],
                };
                let payload = job.payload.take().expect("payload read in prior phase");
                let start = de.offset as usize;
                composed[start..start + de.len as usize].copy_from_slice(&payload);

                self.stage_io(
                    IoCmd::Write {
                        dev: Device::Data,
                        offset: self.data_dev_off(block << self.cfg.block_order),
                        data: Bytes::from(composed),
                    },
                    id,
                    IoPurpose::MoveWrite,
                );
                self.moves.get_mut(&id).unwrap().pending = 1;
            }
            MovePhase::SyncData => {
                if self.ring.free_slots() < 1 {
                    return;
                }
                self.stage_io(
                    IoCmd::Fdatasync { dev: Device::Data },
                    id,
                    IoPurpose::MoveDataFsync,
                );
                self.moves.get_mut(&id).unwrap().pending = 1;
            }
            MovePhase::WriteMeta => {
                let job = &self.moves[&id];
                let set_entry = match job.kind {
                    WriteKind::Small | WriteKind::Big => {
                        Some((job.new_block, ov.oid, ov.version))
                    }
                    WriteKind::Delete => None,
                };
                // The retired block's slot is cleared in the same pass,
                // so the allocator derived from a metadata scan matches
                // the clean index exactly.
                let Some(n) = self.stage_meta_update(id, set_entry, old_block) else {
                    return;
                };
                self.moves.get_mut(&id).unwrap().pending = n;
            }
            MovePhase::SyncMeta => {
                if self.ring.free_slots() < 1 {
                    return;
                }
                self.stage_io(
                    IoCmd::Fdatasync { dev: Device::Meta },
                    id,
                    IoPurpose::MoveMetaFsync,
                );
                self.moves.get_mut(&id).unwrap().pending = 1;
            }
        }
    }

    /// Update the in-memory metadata image and stage writes of the
    /// touched 512-byte metadata sectors. Returns the number of writes,
    /// or None when the ring lacks slots (nothing is mutated then).
    fn stage_meta_update(
        &mut self,
        owner: u64,
        set_entry: Option<(u64, ObjectId, u64)>,
        clear_slot: Option<u64>,
    ) -> Option<u32> {
        let mut sectors: Vec<u64> = Vec::new();
        if let Some((block, _, _)) = set_entry {
            sectors.push(block * CLEAN_ENTRY_SIZE as u64 / SECTOR_SIZE as u64);
        }
        if let Some(block) = clear_slot {
            let s = block * CLEAN_ENTRY_SIZE as u64 / SECTOR_SIZE as u64;
            if !sectors.contains(&s) {
                sectors.push(s);
            }
        }
        if sectors.is_empty() {
            return Some(0);
        }
        if self.ring.free_slots() < sectors.len() {
            return None;
        }

        if let Some((block, oid, version)) = set_entry {
            let off = (block * CLEAN_ENTRY_SIZE as u64) as usize;
            self.meta_image[off..off + CLEAN_ENTRY_SIZE]
                .copy_from_slice(&encode_clean_entry(oid, version));
        }
        if let Some(block) = clear_slot {
            let off = (block * CLEAN_ENTRY_SIZE as u64) as usize;
            self.meta_image[off..off + CLEAN_ENTRY_SIZE].fill(0);
        }

        for s in &sectors {
            let off = (s * SECTOR_SIZE as u64) as usize;
            let data = Bytes::copy_from_slice(&self.meta_image[off..off + SECTOR_SIZE]);
            self.stage_io(
                IoCmd::Write {
                    dev: Device::Meta,
                    offset: self.meta_dev_off(s * SECTOR_SIZE as u64),
                    data,
                },
                owner,
                IoPurpose::MoveMetaWrite,
            );
        }
        Some(sectors.len() as u32)
    }

    /// A flusher I/O completed: record its result, apply the state
    /// transition of the finished phase and stage the next one.
    pub(crate) fn on_move_io(
        &mut self,
        id: u64,
        purpose: IoPurpose,
        result: io::Result<IoOutcome>,
    ) {
        let Some(job) = self.moves.get_mut(&id) else {
            return;
        };
        job.pending -= 1;
        match result {
            Ok(IoOutcome::Read(data)) => match purpose {
                IoPurpose::MoveRead => job.payload = Some(data),
                IoPurpose::MoveReadBase => job.base = Some(data),
                _ => unreachable!("unexpected read outcome"),
            },
            Ok(IoOutcome::Done) => {}
            Err(e) => {
                warn!(job = id, error = %e, "movement I/O failed");
                job.failed = true;
            }
        }
        if job.pending > 0 {
            return;
        }

        let ov = job.ov;
        let kind = job.kind;
        if !job.failed {
            match job.phase {
                MovePhase::ReadPayload => job.phase = MovePhase::WriteData,
                MovePhase::WriteData => {
                    job.phase = MovePhase::SyncData;
                    if let Some(de) = self.dirty.get_mut(&ov) {
                        de.state = DirtyState::JMoved;
                    }
                }
                MovePhase::SyncData => {
                    job.phase = MovePhase::WriteMeta;
                    if let Some(de) = self.dirty.get_mut(&ov) {
                        de.state = DirtyState::JMoveSynced;
                    }
                }
                MovePhase::WriteMeta => {
                    job.phase = MovePhase::SyncMeta;
                    if let Some(de) = self.dirty.get_mut(&ov) {
                        de.state = match kind {
                            WriteKind::Big => DirtyState::DMetaMoved,
                            WriteKind::Delete => DirtyState::DelMoved,
                            WriteKind::Small => de.state,
                        };
                    }
                }
                MovePhase::SyncMeta => {
                    if kind == WriteKind::Big {
                        if let Some(de) = self.dirty.get_mut(&ov) {
                            de.state = DirtyState::DMetaCommitted;
                        }
                    }
                    let moved_block = match kind {
                        WriteKind::Small | WriteKind::Big => Some(self.moves[&id].new_block),
                        WriteKind::Delete => None,
                    };
                    self.moves.remove(&id);
                    self.promote(ov, kind, moved_block);
                    return;
                }
            }
        }
        self.continue_move(id);
    }

    /// Promotion: install (or remove) the committed version, retire the
    /// old block, erase superseded dirty entries and advance trim.
    fn promote(&mut self, ov: ObjVer, kind: WriteKind, moved_block: Option<u64>) {
        let old = self.clean.get(&ov.oid).copied();
        match kind {
            WriteKind::Small | WriteKind::Big => {
                let block = moved_block.expect("moved writes carry a block");
                if old.is_some_and(|c| c.version >= ov.version) {
                    // A newer version was committed first; this block
                    // is already obsolete.
                    self.data_alloc.set(block, false);
                } else {
                    self.clean.insert(
                        ov.oid,
                        CleanEntry {
                            version: ov.version,
                            block,
                        },
                    );
                    match old {
                        Some(c) => self.data_alloc.set(c.block, false),
                        None => {
                            *self.inode_stats.entry(ov.oid.inode).or_insert(0) +=
                                u64::from(self.cfg.block_size);
                        }
                    }
                }
            }
            WriteKind::Delete => {
                if let Some(c) = old {
                    if c.version < ov.version {
                        self.clean.remove(&ov.oid);
                        self.data_alloc.set(c.block, false);
                        let used = self.inode_stats.entry(ov.oid.inode).or_insert(0);
                        *used = used.saturating_sub(u64::from(self.cfg.block_size));
                    }
                }
            }
        }

        // Erase this and all superseded dirty versions.
        let stale: Vec<ObjVer> = self
            .dirty
            .range(ObjVer::new(ov.oid, 0)..=ObjVer::new(ov.oid, ov.version))
            .filter(|(_, de)| de.state != DirtyState::InFlight)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(de) = self.dirty.remove(&key) {
                if de.kind == WriteKind::Big && key != ov {
                    self.data_alloc.set(de.location >> self.cfg.block_order, false);
                }
            }
        }

        self.stats.versions_moved += 1;
        debug!(%ov, "promoted to current");
        self.maybe_trim();
    }

    /// Advance `used_start` past entries whose versions are all moved,
    /// bounded by reader pins, then restate the header checkpoint.
    pub(crate) fn maybe_trim(&mut self) {
        if self.journal.is_empty() {
            return;
        }
        let start = self.journal.used_start;
        let mut best: Option<(u64, u64)> = None;
        let blockers = self
            .dirty
            .values()
            .filter_map(|de| de.journal_block)
            .chain(self.read_pins.keys().copied());
        for off in blockers {
            let dist = self.journal.fwd_dist(start, off);
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, off));
            }
        }

        let new_start = match best {
            Some((_, off)) => off,
            None => self.journal.next_free,
        };
        if new_start == self.journal.used_start {
            return;
        }
        let crc = if new_start == self.journal.next_free {
            self.journal.crc32_last
        } else {
            match self.journal.start_crc_for(new_start) {
                Some(c) => c,
                None => {
                    warn!(new_start, "trim target has no recorded chain value");
                    return;
                }
            }
        };

        self.journal.trim_to(new_start);
        self.stats.journal_trims += 1;
        trace!(new_start, "journal trimmed");
        self.schedule_head_update(new_start, crc);
    }

    fn schedule_head_update(&mut self, start: u64, crc: u32) {
        if self.head_job.is_some() {
            self.head_redo = true;
            return;
        }
        self.head_job = Some(HeadJob {
            start,
            crc,
            synced: false,
            pending: 0,
        });
        self.continue_head();
    }

    fn continue_head(&mut self) {
        let Some(job) = &self.head_job else {
            return;
        };
        let (start, crc, synced, pending) = (job.start, job.crc, job.synced, job.pending);
        if pending > 0 {
            return;
        }
        if self.ring.free_slots() < 1 {
            return;
        }
        if !synced {
            let sector = JournalHeader {
                start_offset: start,
                start_crc32: crc,
            }
            .to_sector();
            self.stage_io(
                IoCmd::Write {
                    dev: Device::Journal,
                    offset: self.journal_dev_off(0),
                    data: sector,
                },
                0,
                IoPurpose::HeadWrite,
            );
        } else {
            self.stage_io(
                IoCmd::Fdatasync {
                    dev: Device::Journal,
                },
                0,
                IoPurpose::HeadFsync,
            );
        }
        self.head_job.as_mut().unwrap().pending = 1;
    }

    pub(crate) fn on_head_io(&mut self, purpose: IoPurpose, result: io::Result<IoOutcome>) {
        let Some(job) = self.head_job.as_mut() else {
            return;
        };
        job.pending -= 1;
        if let Err(e) = result {
            warn!(error = %e, "journal header update failed");
            self.head_job = None;
            return;
        }
        match purpose {
            IoPurpose::HeadWrite => {
                job.synced = true;
                self.continue_head();
            }
            IoPurpose::HeadFsync => {
                self.head_job = None;
                if self.head_redo {
                    self.head_redo = false;
                    let start = self.journal.used_start;
                    let crc = if self.journal.is_empty() {
                        self.journal.crc32_last
                    } else {
                        self.journal.start_crc_for(start).unwrap_or(self.journal.crc32_last)
                    };
                    self.schedule_head_update(start, crc);
                }
            }
            _ => unreachable!("not a header purpose"),
        }
    }
}
