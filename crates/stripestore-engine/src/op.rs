//! Blockstore operations
//!
//! Caller-visible operations are a closed set of tagged variants;
//! dispatch is a plain match, there is no virtual dispatch. Each op
//! carries a one-shot completion callback and lives in the engine's op
//! arena under a stable 64-bit id; kernel completions reference ops by
//! id, never by pointer.

use bytes::Bytes;
use stripestore_common::{ObjVer, ObjectId};

/// One-shot completion continuation.
pub type OpCallback = Box<dyn FnOnce(OpResult)>;

/// What an operation hands back to its caller.
#[derive(Debug, Default)]
pub struct OpResult {
    /// Bytes transferred, or a negative errno-style code.
    pub retval: i64,
    /// For reads: the highest version that contributed bytes.
    /// For writes and deletes: the version written.
    pub version: u64,
    /// For reads: the filled buffer.
    pub data: Vec<u8>,
}

impl OpResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.retval >= 0
    }
}

/// Operation kind and its input payload.
#[derive(Debug)]
pub enum OpPayload {
    Read {
        oid: ObjectId,
        offset: u32,
        len: u32,
        /// Return the newest version even if unstable.
        dirty: bool,
    },
    Write {
        oid: ObjectId,
        version: u64,
        offset: u32,
        len: u32,
        data: Bytes,
    },
    Delete {
        oid: ObjectId,
        version: u64,
    },
    Sync,
    Stabilize {
        versions: Vec<ObjVer>,
    },
    Rollback {
        versions: Vec<ObjVer>,
    },
}

/// Why a queued operation cannot be dispatched right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// No free submission slot in the kernel ring.
    Sqe,
    /// A specific version of an object must finish its initial write.
    InFlight { oid: ObjectId, version: u64 },
    /// This many free journal bytes are required.
    Journal { need: u64 },
    /// The next journal sector buffer is still unsynced.
    JournalBuffer,
}

/// Phase of a multi-phase operation (sync, stabilize, rollback). Each
/// device completion advances the phase; there is no hidden control
/// flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpPhase {
    Init,
    /// Sync: captured writes must leave IN_FLIGHT before the barrier.
    AwaitWrites,
    /// Sync: data-device fdatasync outstanding.
    DataSync,
    /// Journal entries being appended and their sectors written.
    JournalWrite,
    /// Journal fdatasync outstanding.
    JournalSync,
}

/// One queued operation.
pub struct BlockstoreOp {
    pub payload: OpPayload,
    pub callback: Option<OpCallback>,
    pub retval: i64,
    pub result_version: u64,
    /// Read output buffer.
    pub buf: Vec<u8>,
    /// Outstanding child I/O count.
    pub pending: u32,
    pub wait_for: Option<WaitReason>,
    pub phase: OpPhase,
    /// Sync group: big writes captured at dispatch.
    pub sync_big: Vec<ObjVer>,
    /// Sync group: small writes and deletes captured at dispatch.
    pub sync_small: Vec<ObjVer>,
    /// Stabilize/rollback target versions after validation.
    pub targets: Vec<ObjVer>,
    /// Progress cursor for journal-entry emission across re-dispatches.
    pub emit_pos: usize,
    /// Whether the sync marker entry has been appended.
    pub marker_done: bool,
    /// Journal sector offsets pinned by this read, blocking trim for
    /// the duration of the I/O.
    pub journal_pins: Vec<u64>,
}

impl BlockstoreOp {
    #[must_use]
    pub fn new(payload: OpPayload, callback: OpCallback) -> Self {
        let buf = match &payload {
            OpPayload::Read { len, .. } => vec![0u8; *len as usize],
            _ => Vec::new(),
        };
        Self {
            payload,
            callback: Some(callback),
            retval: 0,
            result_version: 0,
            buf,
            pending: 0,
            wait_for: None,
            phase: OpPhase::Init,
            sync_big: Vec::new(),
            sync_small: Vec::new(),
            targets: Vec::new(),
            emit_pos: 0,
            marker_done: false,
            journal_pins: Vec::new(),
        }
    }

    #[must_use]
    pub fn oid(&self) -> Option<ObjectId> {
        match &self.payload {
            OpPayload::Read { oid, .. }
            | OpPayload::Write { oid, .. }
            | OpPayload::Delete { oid, .. } => Some(*oid),
            _ => None,
        }
    }
}

/// What happened when the dispatcher attempted the queue head.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The op completed inline; its callback has fired.
    Finished,
    /// All initial I/Os were staged; the op leaves the queue and will
    /// be finished by completions.
    Submitted,
    /// A multi-phase op staged I/O or is waiting on completions; it
    /// stays at the queue head.
    Pending,
    /// The op cannot proceed; it stays queued with this wait reason.
    Wait(WaitReason),
}

/// Purpose tag carried by each staged submission, so the completion
/// handler knows which state transition a finished I/O drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoPurpose {
    /// Big-write payload landing in the data region.
    WriteData,
    /// A journal sector (entry metadata) write; releases the named
    /// in-memory buffer's claim on completion.
    WriteJournalSector { sector: u32 },
    /// A small-write payload landing in the journal region.
    WriteJournalPayload,
    /// Read fulfilling `buf[buf_off..]` of a read op.
    ReadChunk { buf_off: u32 },
    /// Data-device fdatasync issued by a sync op.
    DataFsync,
    /// Journal-device fdatasync issued by sync/stabilize/rollback.
    JournalFsync,
    /// Flusher: journal payload read.
    MoveRead,
    /// Flusher: current clean block read (merge base).
    MoveReadBase,
    /// Flusher: data block write.
    MoveWrite,
    /// Flusher: data-device fdatasync.
    MoveDataFsync,
    /// Flusher: metadata block write.
    MoveMetaWrite,
    /// Flusher: metadata-device fdatasync.
    MoveMetaFsync,
    /// Journal header rewrite after trim.
    HeadWrite,
    /// Journal-device fdatasync after a header rewrite.
    HeadFsync,
}

/// Back-pointer from a staged submission to its owner.
#[derive(Clone, Copy, Debug)]
pub struct IoTicket {
    /// Op arena id, or flusher job id for Move*/Head* purposes.
    pub owner: u64,
    pub purpose: IoPurpose,
}
