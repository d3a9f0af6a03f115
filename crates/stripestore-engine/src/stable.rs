//! Stabilize and rollback
//!
//! Stabilize is the caller's acknowledgement that a synced version is
//! authoritative: it journals a STABLE entry naming the versions,
//! flushes, and upgrades them to their stable states, which queues them
//! for movement into the data region. Rollback is the inverse for
//! versions that never became authoritative: a ROLLBACK entry followed
//! by removal of the dirty versions.
//!
//! Both validate fully before journaling anything: a missing version
//! fails the whole op with NOT_FOUND, an unsynced one with NOT_SYNCED.

use crate::journal::SpaceCheck;
use crate::layout::{JournalRecord, MAX_BATCH_PER_ENTRY};
use crate::op::{Dispatch, IoPurpose, OpPayload, OpPhase, WaitReason};
use crate::ring::{Device, IoCmd};
use crate::store::{Blockstore, DirtyState, WriteKind};
use stripestore_common::{Error, ObjVer};
use tracing::trace;

impl Blockstore {
    pub(crate) fn dequeue_stable(&mut self, id: u64) -> Dispatch {
        if self.ops[&id].pending > 0 {
            return Dispatch::Pending;
        }
        match self.ops[&id].phase {
            OpPhase::Init => {
                let versions = match &self.ops[&id].payload {
                    OpPayload::Stabilize { versions } => versions.clone(),
                    _ => unreachable!("dequeue_stable on non-stabilize op"),
                };
                let mut targets = Vec::new();
                for ov in versions {
                    match self.dirty.get(&ov) {
                        Some(de)
                            if matches!(
                                de.state,
                                DirtyState::JSynced
                                    | DirtyState::DMetaSynced
                                    | DirtyState::DelSynced
                            ) =>
                        {
                            targets.push(ov);
                        }
                        Some(de) if de.state.is_stable() => {
                            // Already acknowledged; idempotent.
                        }
                        Some(_) => {
                            self.fail_op(id, &Error::not_synced(ov.oid, ov.version));
                            return Dispatch::Finished;
                        }
                        None => {
                            let promoted = self
                                .clean
                                .get(&ov.oid)
                                .map(|c| c.version >= ov.version)
                                .unwrap_or(false);
                            if !promoted {
                                self.fail_op(id, &Error::not_found(ov.oid, ov.version));
                                return Dispatch::Finished;
                            }
                        }
                    }
                }
                if targets.is_empty() {
                    self.ops.get_mut(&id).unwrap().retval = 0;
                    self.finish_op(id);
                    return Dispatch::Finished;
                }
                let op = self.ops.get_mut(&id).unwrap();
                op.targets = targets;
                op.phase = OpPhase::JournalWrite;
                self.dequeue_stable(id)
            }
            OpPhase::JournalWrite => {
                self.emit_batch_entries(id, false)
            }
            OpPhase::JournalSync => Dispatch::Pending,
            _ => unreachable!("stabilize has no such phase"),
        }
    }

    pub(crate) fn dequeue_rollback(&mut self, id: u64) -> Dispatch {
        if self.ops[&id].pending > 0 {
            return Dispatch::Pending;
        }
        match self.ops[&id].phase {
            OpPhase::Init => {
                let versions = match &self.ops[&id].payload {
                    OpPayload::Rollback { versions } => versions.clone(),
                    _ => unreachable!("dequeue_rollback on non-rollback op"),
                };
                let mut targets = Vec::new();
                for ov in versions {
                    match self.dirty.get(&ov) {
                        None => {
                            self.fail_op(id, &Error::not_found(ov.oid, ov.version));
                            return Dispatch::Finished;
                        }
                        Some(de) if de.state == DirtyState::InFlight => {
                            self.fail_op(id, &Error::not_synced(ov.oid, ov.version));
                            return Dispatch::Finished;
                        }
                        Some(de) if de.state.is_stable() => {
                            self.fail_op(
                                id,
                                &Error::invalid(format!("{ov} is stable and cannot roll back")),
                            );
                            return Dispatch::Finished;
                        }
                        Some(_) => targets.push(ov),
                    }
                }
                if targets.is_empty() {
                    self.ops.get_mut(&id).unwrap().retval = 0;
                    self.finish_op(id);
                    return Dispatch::Finished;
                }
                let op = self.ops.get_mut(&id).unwrap();
                op.targets = targets;
                op.phase = OpPhase::JournalWrite;
                self.dequeue_rollback(id)
            }
            OpPhase::JournalWrite => self.emit_batch_entries(id, true),
            OpPhase::JournalSync => Dispatch::Pending,
            _ => unreachable!("rollback has no such phase"),
        }
    }

    /// Journal STABLE (or ROLLBACK) entries covering the op's targets,
    /// batching as many (oid, version) pairs per entry as a sector
    /// allows, then the trailing fdatasync.
    fn emit_batch_entries(&mut self, id: u64, rollback: bool) -> Dispatch {
        let targets = self.ops[&id].targets.clone();
        let mut pos = self.ops[&id].emit_pos;

        while pos < targets.len() {
            let end = (pos + MAX_BATCH_PER_ENTRY).min(targets.len());
            let chunk = targets[pos..end].to_vec();
            let rec = if rollback {
                JournalRecord::Rollback { versions: chunk }
            } else {
                JournalRecord::Stable { versions: chunk }
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
            self.ops.get_mut(&id).unwrap().pending += 1;
            pos = end;
        }
        self.ops.get_mut(&id).unwrap().emit_pos = pos;

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

    /// Upgrade the acknowledged versions and hand them to the flusher.
    pub(crate) fn apply_stabilize(&mut self, targets: &[ObjVer]) {
        for ov in targets {
            let Some(de) = self.dirty.get_mut(ov) else {
                continue;
            };
            de.state = match de.state {
                DirtyState::JSynced => DirtyState::JStable,
                DirtyState::DMetaSynced => DirtyState::DStable,
                DirtyState::DelSynced => DirtyState::DelStable,
                other => other,
            };
            if de.state.is_stable() {
                self.flush_queue.push_back(*ov);
                trace!(%ov, "stabilized");
            }
        }
    }

    /// Drop the rolled-back versions and return their resources.
    pub(crate) fn apply_rollback(&mut self, targets: &[ObjVer]) {
        for ov in targets {
            if let Some(de) = self.dirty.remove(ov) {
                if de.kind == WriteKind::Big {
                    self.data_alloc.set(de.location >> self.cfg.block_order, false);
                }
                trace!(%ov, "rolled back");
            }
        }
        self.unsynced_big.retain(|ov| !targets.contains(ov));
        self.unsynced_small.retain(|ov| !targets.contains(ov));
        self.maybe_trim();
    }
}
