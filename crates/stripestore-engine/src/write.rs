//! Write path
//!
//! A dirty entry is recorded at enqueue time; dispatch turns it into
//! device I/O. Full-block writes redirect to a freshly allocated data
//! block (one submission); partial-block writes reserve journal space
//! and go out as two submissions, the entry sector and the payload.
//! Writes to different versions never overlap on disk, so they may
//! submit and complete in any order.

use crate::journal::SpaceCheck;
use crate::layout::JournalRecord;
use crate::op::{Dispatch, IoPurpose, OpPayload, WaitReason};
use crate::ring::{Device, IoCmd, IoOutcome};
use crate::store::{Blockstore, DirtyState, WriteKind};
use std::io;
use stripestore_common::{Error, ObjVer};
use tracing::{trace, warn};

impl Blockstore {
    pub(crate) fn dequeue_write(&mut self, id: u64) -> Dispatch {
        let (oid, version, offset, len, data) = match &self.ops[&id].payload {
            OpPayload::Write {
                oid,
                version,
                offset,
                len,
                data,
            } => (*oid, *version, *offset, *len, data.clone()),
            _ => unreachable!("dequeue_write on non-write op"),
        };
        let ov = ObjVer::new(oid, version);
        let kind = self.dirty[&ov].kind;

        if kind == WriteKind::Big {
            // Redirect write: one fresh data block.
            let Some(block) = self.data_alloc.allocate() else {
                self.dirty.remove(&ov);
                self.fail_op(id, &Error::NoSpace);
                return Dispatch::Finished;
            };
            let loc = block << self.cfg.block_order;
            let staged = self.stage_io(
                IoCmd::Write {
                    dev: Device::Data,
                    offset: self.data_dev_off(loc),
                    data,
                },
                id,
                IoPurpose::WriteData,
            );
            if !staged {
                self.data_alloc.set(block, false);
                return Dispatch::Wait(WaitReason::Sqe);
            }
            self.dirty.get_mut(&ov).unwrap().location = loc;
            self.ops.get_mut(&id).unwrap().pending = 1;
            self.unsynced_big.push(ov);
            trace!(%ov, block, "big write dispatched");
            return Dispatch::Submitted;
        }

        // Journaled write: entry + payload.
        let rec = JournalRecord::SmallWrite {
            oid,
            version,
            offset,
            len,
        };
        match self.journal.check_space(&rec) {
            SpaceCheck::NeedBuffer => return Dispatch::Wait(WaitReason::JournalBuffer),
            SpaceCheck::NeedBytes(need) => {
                if need > self.journal.capacity() {
                    self.dirty.remove(&ov);
                    self.fail_op(id, &Error::NoSpace);
                    return Dispatch::Finished;
                }
                return Dispatch::Wait(WaitReason::Journal { need });
            }
            SpaceCheck::Fits => {}
        }
        if self.ring.free_slots() < 2 {
            return Dispatch::Wait(WaitReason::Sqe);
        }

        let appended = self.journal.append(&rec);
        let payload_off = appended
            .payload_offset
            .expect("small write reserves a payload");
        let (sector_off, sector_bytes) = self.journal.sector_snapshot(appended.sector);

        let ok = self.stage_io(
            IoCmd::Write {
                dev: Device::Journal,
                offset: self.journal_dev_off(sector_off),
                data: sector_bytes,
            },
            id,
            IoPurpose::WriteJournalSector {
                sector: appended.sector as u32,
            },
        ) && self.stage_io(
            IoCmd::Write {
                dev: Device::Journal,
                offset: self.journal_dev_off(payload_off),
                data,
            },
            id,
            IoPurpose::WriteJournalPayload,
        );
        debug_assert!(ok, "slots were reserved above");

        let de = self.dirty.get_mut(&ov).unwrap();
        de.location = payload_off;
        de.journal_block = Some(appended.sector_offset);
        self.ops.get_mut(&id).unwrap().pending = 2;
        self.unsynced_small.push(ov);
        trace!(%ov, payload_off, "small write dispatched");
        Dispatch::Submitted
    }

    pub(crate) fn dequeue_delete(&mut self, id: u64) -> Dispatch {
        let (oid, version) = match &self.ops[&id].payload {
            OpPayload::Delete { oid, version } => (*oid, *version),
            _ => unreachable!("dequeue_delete on non-delete op"),
        };
        let ov = ObjVer::new(oid, version);

        let rec = JournalRecord::Delete { oid, version };
        match self.journal.check_space(&rec) {
            SpaceCheck::NeedBuffer => return Dispatch::Wait(WaitReason::JournalBuffer),
            SpaceCheck::NeedBytes(need) => return Dispatch::Wait(WaitReason::Journal { need }),
            SpaceCheck::Fits => {}
        }
        if self.ring.free_slots() < 1 {
            return Dispatch::Wait(WaitReason::Sqe);
        }

        let appended = self.journal.append(&rec);
        let (sector_off, sector_bytes) = self.journal.sector_snapshot(appended.sector);
        let ok = self.stage_io(
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
        debug_assert!(ok, "slot was reserved above");

        self.dirty.get_mut(&ov).unwrap().journal_block = Some(appended.sector_offset);
        self.ops.get_mut(&id).unwrap().pending = 1;
        self.unsynced_small.push(ov);
        trace!(%ov, "delete dispatched");
        Dispatch::Submitted
    }

    /// Big-write data landed in its block.
    pub(crate) fn on_big_write_done(&mut self, id: u64, result: io::Result<IoOutcome>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.pending -= 1;
        if let Err(e) = result {
            warn!(op = id, error = %e, "big write failed");
            op.retval = Error::Io(e).retval();
        }
        if op.pending > 0 {
            return;
        }

        let (oid, version, len) = match &op.payload {
            OpPayload::Write {
                oid, version, len, ..
            } => (*oid, *version, *len),
            _ => unreachable!(),
        };
        if op.retval >= 0 {
            op.retval = i64::from(len);
            let ov = ObjVer::new(oid, version);
            if let Some(de) = self.dirty.get_mut(&ov) {
                debug_assert_eq!(de.state, DirtyState::InFlight);
                de.state = DirtyState::DWritten;
            }
        }
        self.finish_op(id);
    }

    /// A journal sector or payload write completed. Finishes small
    /// writes and deletes; multi-phase ops are driven to completion by
    /// their journal fdatasync instead.
    pub(crate) fn on_journal_write_done(&mut self, id: u64, result: io::Result<IoOutcome>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.pending -= 1;
        if let Err(e) = result {
            warn!(op = id, error = %e, "journal write failed");
            op.retval = Error::Io(e).retval();
        }
        if op.pending > 0 {
            return;
        }

        match &op.payload {
            OpPayload::Write {
                oid, version, len, ..
            } => {
                let (oid, version, len) = (*oid, *version, *len);
                if op.retval >= 0 {
                    op.retval = i64::from(len);
                    if let Some(de) = self.dirty.get_mut(&ObjVer::new(oid, version)) {
                        debug_assert_eq!(de.state, DirtyState::InFlight);
                        de.state = DirtyState::JWritten;
                    }
                }
                self.finish_op(id);
            }
            OpPayload::Delete { oid, version } => {
                let (oid, version) = (*oid, *version);
                if op.retval >= 0 {
                    if let Some(de) = self.dirty.get_mut(&ObjVer::new(oid, version)) {
                        debug_assert_eq!(de.state, DirtyState::InFlight);
                        de.state = DirtyState::DelWritten;
                    }
                }
                self.finish_op(id);
            }
            // Sync / stabilize / rollback sector flushes: the trailing
            // journal fdatasync completes the op.
            _ => {}
        }
    }
}
