//! Sync path
//!
//! A sync captures every write and delete left unsynced at its
//! dispatch (the submission queue is FIFO, so the group is exactly the
//! operations enqueued before it) and drives the group to durability:
//!
//! 1. data-device fdatasync for big writes still in D_WRITTEN,
//! 2. one BIG_WRITE journal entry per synced big write, a SYNC marker,
//!    and the touched sectors written out,
//! 3. journal fdatasync, after which the whole group counts as synced.
//!
//! The op is an explicit phase machine and stays at the queue head
//! until done; each device completion advances the phase. A phase that
//! cannot get journal space or submission slots parks the op with the
//! corresponding wait reason and resumes at the same phase.

use crate::journal::SpaceCheck;
use crate::layout::JournalRecord;
use crate::op::{Dispatch, IoPurpose, OpPayload, OpPhase, WaitReason};
use crate::ring::{Device, IoCmd, IoOutcome};
use crate::store::{Blockstore, DirtyState};
use std::io;
use stripestore_common::{Error, ObjVer};
use tracing::{trace, warn};

impl Blockstore {
    pub(crate) fn dequeue_sync(&mut self, id: u64) -> Dispatch {
        if self.ops[&id].pending > 0 {
            return Dispatch::Pending;
        }
        match self.ops[&id].phase {
            OpPhase::Init => {
                let big = std::mem::take(&mut self.unsynced_big);
                let small = std::mem::take(&mut self.unsynced_small);
                if big.is_empty() && small.is_empty() {
                    self.ops.get_mut(&id).unwrap().retval = 0;
                    self.finish_op(id);
                    return Dispatch::Finished;
                }
                let op = self.ops.get_mut(&id).unwrap();
                op.sync_big = big;
                op.sync_small = small;
                op.phase = OpPhase::AwaitWrites;
                self.dequeue_sync(id)
            }
            OpPhase::AwaitWrites => {
                // The barrier orders after the writes it captured; all
                // of them must have left IN_FLIGHT first.
                let op = &self.ops[&id];
                let pending_write = op
                    .sync_big
                    .iter()
                    .chain(op.sync_small.iter())
                    .find(|ov| {
                        self.dirty
                            .get(ov)
                            .map(|de| de.state == DirtyState::InFlight)
                            .unwrap_or(false)
                    })
                    .copied();
                if let Some(ov) = pending_write {
                    return Dispatch::Wait(WaitReason::InFlight {
                        oid: ov.oid,
                        version: ov.version,
                    });
                }

                let needs_data_sync = self.ops[&id].sync_big.iter().any(|ov| {
                    matches!(
                        self.dirty.get(ov).map(|de| de.state),
                        Some(DirtyState::DWritten)
                    )
                });
                if needs_data_sync {
                    if !self.stage_io(
                        IoCmd::Fdatasync { dev: Device::Data },
                        id,
                        IoPurpose::DataFsync,
                    ) {
                        return Dispatch::Wait(WaitReason::Sqe);
                    }
                    let op = self.ops.get_mut(&id).unwrap();
                    op.pending = 1;
                    op.phase = OpPhase::DataSync;
                    return Dispatch::Pending;
                }
                self.ops.get_mut(&id).unwrap().phase = OpPhase::JournalWrite;
                self.dequeue_sync(id)
            }
            // The completion handler advances out of DataSync; reaching
            // here idle means the fsync already landed.
            OpPhase::DataSync | OpPhase::JournalWrite => self.emit_sync_entries(id),
            OpPhase::JournalSync => Dispatch::Pending,
        }
    }

    /// Phase 2: journal a BIG_WRITE entry per synced big write, then
    /// the SYNC marker, then the journal fdatasync. Resumable at entry
    /// granularity via the op's emit cursor.
    fn emit_sync_entries(&mut self, id: u64) -> Dispatch {
        let group = self.ops[&id].sync_big.clone();
        let mut pos = self.ops[&id].emit_pos;

        while pos < group.len() {
            let ov = group[pos];
            let Some(de) = self.dirty.get(&ov).copied() else {
                pos += 1;
                continue;
            };
            if de.state != DirtyState::DSynced {
                pos += 1;
                continue;
            }
            let rec = JournalRecord::BigWrite {
                oid: ov.oid,
                version: ov.version,
                location: de.location,
            };
            match self.journal.check_space(&rec) {
                SpaceCheck::NeedBuffer => {
                    self.ops.get_mut(&id).unwrap().emit_pos = pos;
                    return Dispatch::Wait(WaitReason::JournalBuffer);
                }
                SpaceCheck::NeedBytes(need) => {
                    self.ops.get_mut(&id).unwrap().emit_pos = pos;
                    return Dispatch::Wait(WaitReason::Journal { need });
                }
                SpaceCheck::Fits => {}
            }
            if self.ring.free_slots() < 1 {
                self.ops.get_mut(&id).unwrap().emit_pos = pos;
                return Dispatch::Wait(WaitReason::Sqe);
            }

            let appended = self.journal.append(&rec);
            let (sector_off, sector_bytes) = self.journal.sector_snapshot(appended.sector);
            self.stage_io(
                IoCmd::Write {
                    dev: Device::Journal,
                    offset: self.journal_dev_off(sector_off),
                    data: sector_bytes,
                },
                id,
                IoPurpose::WriteJournalSector {
                    sector: appended.sector as u32,
                },
            );
            let de = self.dirty.get_mut(&ov).unwrap();
            de.state = DirtyState::DMetaWritten;
            de.journal_block = Some(appended.sector_offset);
            self.ops.get_mut(&id).unwrap().pending += 1;
            trace!(%ov, "big-write journal entry emitted");
            pos += 1;
        }
        self.ops.get_mut(&id).unwrap().emit_pos = pos;

        if !self.ops[&id].marker_done {
            let rec = JournalRecord::Sync;
            match self.journal.check_space(&rec) {
                SpaceCheck::NeedBuffer => return Dispatch::Wait(WaitReason::JournalBuffer),
                SpaceCheck::NeedBytes(need) => {
                    return Dispatch::Wait(WaitReason::Journal { need })
                }
                SpaceCheck::Fits => {}
            }
            if self.ring.free_slots() < 2 {
                return Dispatch::Wait(WaitReason::Sqe);
            }
            let appended = self.journal.append(&rec);
            let (sector_off, sector_bytes) = self.journal.sector_snapshot(appended.sector);
            self.stage_io(
                IoCmd::Write {
                    dev: Device::Journal,
                    offset: self.journal_dev_off(sector_off),
                    data: sector_bytes,
                },
                id,
                IoPurpose::WriteJournalSector {
                    sector: appended.sector as u32,
                },
            );
            let op = self.ops.get_mut(&id).unwrap();
            op.pending += 1;
            op.marker_done = true;
        }

        if self.ring.free_slots() < 1 {
            return Dispatch::Wait(WaitReason::Sqe);
        }
        self.stage_io(
            IoCmd::Fdatasync {
                dev: Device::Journal,
            },
            id,
            IoPurpose::JournalFsync,
        );
        let op = self.ops.get_mut(&id).unwrap();
        op.pending += 1;
        op.phase = OpPhase::JournalSync;
        Dispatch::Pending
    }

    /// Data-device fdatasync landed: big writes in the group become
    /// D_SYNCED and the journal-entry phase begins.
    pub(crate) fn on_data_fsync_done(&mut self, id: u64, result: io::Result<IoOutcome>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.pending -= 1;
        if let Err(e) = result {
            warn!(op = id, error = %e, "data fdatasync failed");
            op.retval = Error::Io(e).retval();
            self.finish_op(id);
            return;
        }
        op.phase = OpPhase::JournalWrite;
        let group = op.sync_big.clone();
        for ov in group {
            if let Some(de) = self.dirty.get_mut(&ov) {
                if de.state == DirtyState::DWritten {
                    de.state = DirtyState::DSynced;
                }
            }
        }
    }

    /// Journal fdatasync landed: complete the barrier (sync) or apply
    /// the stabilize/rollback the entries described.
    pub(crate) fn on_journal_fsync_done(&mut self, id: u64, result: io::Result<IoOutcome>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.pending -= 1;
        if let Err(e) = result {
            warn!(op = id, error = %e, "journal fdatasync failed");
            op.retval = Error::Io(e).retval();
        }
        if op.pending > 0 {
            return;
        }
        // A failed sector write earlier in the batch also poisons the
        // barrier; no state may advance on partial durability.
        let failed = op.retval < 0;

        let op = self.ops.get_mut(&id).unwrap();
        match &op.payload {
            OpPayload::Sync => {
                if !failed {
                    let big = op.sync_big.clone();
                    let small = op.sync_small.clone();
                    self.apply_sync_group(&big, &small);
                }
                self.finish_op(id);
            }
            OpPayload::Stabilize { .. } => {
                if !failed {
                    let targets = op.targets.clone();
                    self.apply_stabilize(&targets);
                }
                self.finish_op(id);
            }
            OpPayload::Rollback { .. } => {
                if !failed {
                    let targets = op.targets.clone();
                    self.apply_rollback(&targets);
                }
                self.finish_op(id);
            }
            _ => unreachable!("journal fsync on a single-phase op"),
        }
    }

    fn apply_sync_group(&mut self, big: &[ObjVer], small: &[ObjVer]) {
        for ov in big {
            if let Some(de) = self.dirty.get_mut(ov) {
                if de.state == DirtyState::DMetaWritten {
                    de.state = DirtyState::DMetaSynced;
                }
            }
        }
        for ov in small {
            if let Some(de) = self.dirty.get_mut(ov) {
                match de.state {
                    DirtyState::JWritten => de.state = DirtyState::JSynced,
                    DirtyState::DelWritten => de.state = DirtyState::DelSynced,
                    _ => {}
                }
            }
        }
    }
}
