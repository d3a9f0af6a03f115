//! Read path
//!
//! A read resolves newest-first across the dirty versions of its
//! object, then the clean entry, keeping an ordered map of byte ranges
//! already claimed by a higher version. Each remaining gap becomes a
//! device read from the journal or data region (chosen by the source's
//! state), a zero-fill (deleted or never-written ranges), or - when the
//! covering version is still IN_FLIGHT - a stall: the whole submission
//! is rolled back and the op parks until that version is written.
//! Higher layers rely on the stall for read-modify-write parity
//! calculation, so it applies even when an older stable version covers
//! the range.

use crate::op::{Dispatch, IoPurpose, OpPayload, WaitReason};
use crate::ring::{Device, IoCmd, IoOutcome};
use crate::store::{Blockstore, DirtyEntry, DirtyState, WriteKind};
use std::collections::BTreeMap;
use std::io;
use stripestore_common::{Error, ObjVer};
use tracing::{trace, warn};

/// Unfulfilled sub-ranges of `[start, end)` given the claimed map.
fn gaps_in(fulfilled: &BTreeMap<u32, u32>, start: u32, end: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut cur = start;
    for (&s, &l) in fulfilled.range(..end) {
        let e = s + l;
        if e <= cur {
            continue;
        }
        if s > cur {
            out.push((cur, s.min(end)));
        }
        cur = cur.max(e);
        if cur >= end {
            break;
        }
    }
    if cur < end {
        out.push((cur, end));
    }
    out
}

impl Blockstore {
    pub(crate) fn dequeue_read(&mut self, id: u64) -> Dispatch {
        let (oid, req_off, req_len, want_dirty) = match &self.ops[&id].payload {
            OpPayload::Read {
                oid,
                offset,
                len,
                dirty,
            } => (*oid, *offset, *len, *dirty),
            _ => unreachable!("dequeue_read on non-read op"),
        };
        let req_end = req_off + req_len;

        let ring_mark = self.ring.stage_mark();
        let token_mark = self.next_token;

        // Dirty versions newest-first, then the clean entry.
        let candidates: Vec<(u64, DirtyEntry)> = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .rev()
            .map(|(ov, de)| (ov.version, *de))
            .collect();

        let mut fulfilled: BTreeMap<u32, u32> = BTreeMap::new();
        let mut pending: u32 = 0;
        let mut top_version: u64 = 0;
        let mut pins: Vec<u64> = Vec::new();

        for (version, de) in candidates {
            let item_start = de.offset.max(req_off);
            let item_end = (de.offset + de.len).min(req_end);
            if item_start >= item_end {
                continue;
            }
            let gaps = gaps_in(&fulfilled, item_start, item_end);
            if gaps.is_empty() {
                continue;
            }

            if de.state == DirtyState::InFlight {
                // Abandon this pass entirely; resume once the version
                // is written somewhere.
                self.rollback_staged(ring_mark, token_mark);
                trace!(%oid, version, "read stalls on in-flight version");
                return Dispatch::Wait(WaitReason::InFlight { oid, version });
            }
            if !want_dirty && !de.state.is_stable() {
                continue;
            }

            for (gap_start, gap_end) in gaps {
                if de.state.is_deletion() {
                    // Deleted range: the output buffer is pre-zeroed.
                    fulfilled.insert(gap_start, gap_end - gap_start);
                    if top_version == 0 {
                        top_version = version;
                    }
                    continue;
                }
                let (dev, dev_off) = match de.kind {
                    WriteKind::Small => (
                        Device::Journal,
                        self.journal_dev_off(de.location + u64::from(gap_start - de.offset)),
                    ),
                    WriteKind::Big => (
                        Device::Data,
                        self.data_dev_off(de.location + u64::from(gap_start)),
                    ),
                    WriteKind::Delete => unreachable!("deletion handled above"),
                };
                let staged = self.stage_io(
                    IoCmd::Read {
                        dev,
                        offset: dev_off,
                        len: gap_end - gap_start,
                    },
                    id,
                    IoPurpose::ReadChunk {
                        buf_off: gap_start - req_off,
                    },
                );
                if !staged {
                    self.rollback_staged(ring_mark, token_mark);
                    return Dispatch::Wait(WaitReason::Sqe);
                }
                pending += 1;
                fulfilled.insert(gap_start, gap_end - gap_start);
                if top_version == 0 {
                    top_version = version;
                }
                if de.kind == WriteKind::Small {
                    if let Some(sector) = de.journal_block {
                        if !pins.contains(&sector) {
                            pins.push(sector);
                        }
                    }
                }
            }
        }

        if let Some(ce) = self.clean.get(&oid).copied() {
            let loc = ce.block << self.cfg.block_order;
            for (gap_start, gap_end) in gaps_in(&fulfilled, req_off, req_end) {
                let staged = self.stage_io(
                    IoCmd::Read {
                        dev: Device::Data,
                        offset: self.data_dev_off(loc + u64::from(gap_start)),
                        len: gap_end - gap_start,
                    },
                    id,
                    IoPurpose::ReadChunk {
                        buf_off: gap_start - req_off,
                    },
                );
                if !staged {
                    self.rollback_staged(ring_mark, token_mark);
                    return Dispatch::Wait(WaitReason::Sqe);
                }
                pending += 1;
                fulfilled.insert(gap_start, gap_end - gap_start);
                if top_version == 0 {
                    top_version = ce.version;
                }
            }
        }

        // Anything still uncovered stays zero (unallocated range).
        if pending == 0 {
            let op = self.ops.get_mut(&id).unwrap();
            op.retval = i64::from(req_len);
            op.result_version = top_version;
            self.finish_op(id);
            return Dispatch::Finished;
        }

        let op = self.ops.get_mut(&id).unwrap();
        op.pending = pending;
        op.result_version = top_version;
        op.journal_pins = pins.clone();
        for pin in pins {
            self.add_pin(pin);
        }
        Dispatch::Submitted
    }

    /// One read chunk arrived; copy it into the caller's buffer.
    pub(crate) fn on_read_chunk(&mut self, id: u64, buf_off: u32, result: io::Result<IoOutcome>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.pending -= 1;
        match result {
            Ok(IoOutcome::Read(data)) => {
                let off = buf_off as usize;
                op.buf[off..off + data.len()].copy_from_slice(&data);
            }
            Ok(IoOutcome::Done) => unreachable!("read completion without data"),
            Err(e) => {
                warn!(op = id, error = %e, "read chunk failed");
                op.retval = Error::Io(e).retval();
            }
        }
        if op.pending == 0 {
            if op.retval >= 0 {
                if let OpPayload::Read { len, .. } = &op.payload {
                    op.retval = i64::from(*len);
                }
            }
            self.finish_op(id);
        }
    }
}
