//! StripeStore Engine - the local blockstore
//!
//! A single-node object blockstore: fixed-size versioned object blocks
//! persisted on raw block devices with crash-consistent semantics.
//! Writes go through a ring-buffered write-ahead journal (partial-block
//! writes) or straight to freshly allocated data blocks (full-block
//! writes); a dense metadata table records committed versions; an
//! in-memory version index resolves reads across in-flight, journaled
//! and committed state.
//!
//! The engine is a single-threaded cooperative loop: callers enqueue
//! operations and drive [`Blockstore::run_one`] (or
//! [`Blockstore::run_until_idle`]); completions of asynchronous device
//! I/O advance per-operation state machines and fire the operation
//! callbacks.

pub mod alloc;
pub mod flush;
pub mod journal;
pub mod layout;
pub mod op;
pub mod raw_io;
pub mod read;
pub mod recovery;
pub mod ring;
pub mod stable;
pub mod store;
pub mod sync;
pub mod write;

pub use alloc::BlockBitmap;
pub use journal::Journal;
pub use op::{BlockstoreOp, OpCallback, OpPayload, OpResult, WaitReason};
pub use raw_io::{AlignedBuffer, RawFile};
pub use ring::{Device, FileBackend, IoCmd, MemBackend, MemHandle, Ring, RingBackend};
pub use store::{Blockstore, CleanEntry, DirtyEntry, DirtyState, StoreStats, WriteKind};
