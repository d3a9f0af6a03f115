//! Asynchronous I/O submission ring
//!
//! The engine talks to its devices through a bounded
//! submission/completion queue pair, the shape a completion-based
//! kernel interface exposes. Commands are *staged* with a caller-chosen
//! token, pushed to the backend with [`Ring::submit`], and their
//! completions harvested with [`Ring::poll`]. A dispatch attempt that
//! cannot get all the slots it needs rolls its staged entries back with
//! [`Ring::unstage_to`] and parks until a completion frees capacity.
//!
//! Two backends:
//! - [`FileBackend`] drives raw files or block devices (O_DIRECT where
//!   available, `fdatasync` as the durability barrier).
//! - [`MemBackend`] keeps per-device byte images with separate volatile
//!   and durable copies; `fdatasync` promotes volatile bytes to the
//!   durable image, which crash-consistency tests snapshot to simulate
//!   power loss.

use crate::raw_io::{AlignedBuffer, RawFile};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// The three device roles of a store. Roles may share one physical
/// device; the backend maps roles to handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    Data,
    Meta,
    Journal,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Data, Device::Meta, Device::Journal];

    fn index(self) -> usize {
        match self {
            Device::Data => 0,
            Device::Meta => 1,
            Device::Journal => 2,
        }
    }
}

/// One I/O command against a device.
#[derive(Debug, Clone)]
pub enum IoCmd {
    Read { dev: Device, offset: u64, len: u32 },
    Write { dev: Device, offset: u64, data: Bytes },
    Fdatasync { dev: Device },
}

/// Successful outcome of a command.
#[derive(Debug)]
pub enum IoOutcome {
    /// Read completed with the filled buffer.
    Read(Bytes),
    /// Write or fdatasync completed.
    Done,
}

/// A harvested completion.
#[derive(Debug)]
pub struct Completion {
    pub token: u64,
    pub result: io::Result<IoOutcome>,
}

/// Backend executing ring commands against real or simulated devices.
pub trait RingBackend: Send {
    /// Execute one command to completion.
    fn run(&mut self, cmd: IoCmd) -> io::Result<IoOutcome>;

    /// Total length of the named device in bytes.
    fn device_len(&self, dev: Device) -> u64;
}

/// Bounded submission/completion ring over a [`RingBackend`].
pub struct Ring {
    backend: Box<dyn RingBackend>,
    depth: usize,
    staged: Vec<(u64, IoCmd)>,
    completed: VecDeque<Completion>,
}

impl Ring {
    pub fn new(backend: Box<dyn RingBackend>, depth: usize) -> Self {
        assert!(depth > 0, "ring depth must be positive");
        Self {
            backend,
            depth,
            staged: Vec::new(),
            completed: VecDeque::new(),
        }
    }

    /// Submission slots currently available.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.depth
            .saturating_sub(self.staged.len() + self.completed.len())
    }

    /// Stage a command. Returns false when the ring is full; the caller
    /// parks with the SQE wait reason and retries after a completion.
    pub fn stage(&mut self, token: u64, cmd: IoCmd) -> bool {
        if self.free_slots() == 0 {
            return false;
        }
        self.staged.push((token, cmd));
        true
    }

    /// Mark the current staged position for speculative reservation.
    #[must_use]
    pub fn stage_mark(&self) -> usize {
        self.staged.len()
    }

    /// Roll staged entries back to a previous mark. Used when a
    /// dispatch attempt fails partway and must not leave half its I/Os
    /// queued.
    pub fn unstage_to(&mut self, mark: usize) {
        self.staged.truncate(mark);
    }

    /// Push all staged commands to the backend, in staging order.
    /// Returns the number of commands submitted.
    pub fn submit(&mut self) -> usize {
        let batch: Vec<(u64, IoCmd)> = self.staged.drain(..).collect();
        let n = batch.len();
        for (token, cmd) in batch {
            let result = self.backend.run(cmd);
            self.completed.push_back(Completion { token, result });
        }
        n
    }

    /// Harvest one completion, if any.
    pub fn poll(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    /// Execute a command immediately, bypassing the queue. Used by
    /// startup (recovery, format) before the event loop runs.
    pub fn run_direct(&mut self, cmd: IoCmd) -> io::Result<IoOutcome> {
        self.backend.run(cmd)
    }

    #[must_use]
    pub fn device_len(&self, dev: Device) -> u64 {
        self.backend.device_len(dev)
    }
}

// ── File-backed devices ────────────────────────────────────────────────────

/// Backend over raw files or block devices.
///
/// Device roles sharing one path share one open handle, so a combined
/// data+journal device sees a single file description and one
/// `fdatasync` covers both regions.
pub struct FileBackend {
    files: Vec<RawFile>,
    /// Device role -> index into `files`.
    role_map: [usize; 3],
}

impl FileBackend {
    /// Open the devices named by the three paths. Paths may coincide.
    pub fn open(
        data: impl AsRef<Path>,
        meta: impl AsRef<Path>,
        journal: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let paths = [
            data.as_ref().to_path_buf(),
            meta.as_ref().to_path_buf(),
            journal.as_ref().to_path_buf(),
        ];
        let mut files: Vec<RawFile> = Vec::new();
        let mut opened: Vec<std::path::PathBuf> = Vec::new();
        let mut role_map = [0usize; 3];

        for (role, path) in paths.iter().enumerate() {
            match opened.iter().position(|p| p == path) {
                Some(idx) => role_map[role] = idx,
                None => {
                    files.push(RawFile::open(path)?);
                    opened.push(path.clone());
                    role_map[role] = files.len() - 1;
                }
            }
        }

        Ok(Self { files, role_map })
    }

    fn file(&self, dev: Device) -> &RawFile {
        &self.files[self.role_map[dev.index()]]
    }
}

impl RingBackend for FileBackend {
    fn run(&mut self, cmd: IoCmd) -> io::Result<IoOutcome> {
        match cmd {
            IoCmd::Read { dev, offset, len } => {
                let mut buf = AlignedBuffer::new(len as usize);
                self.file(dev).read_at(offset, buf.as_mut_slice())?;
                Ok(IoOutcome::Read(Bytes::copy_from_slice(
                    &buf.as_slice()[..len as usize],
                )))
            }
            IoCmd::Write { dev, offset, data } => {
                let mut buf = AlignedBuffer::new(data.len());
                buf.copy_from(&data);
                self.file(dev).write_at(offset, buf.as_slice())?;
                Ok(IoOutcome::Done)
            }
            IoCmd::Fdatasync { dev } => {
                self.file(dev).sync_data()?;
                Ok(IoOutcome::Done)
            }
        }
    }

    fn device_len(&self, dev: Device) -> u64 {
        self.file(dev).size()
    }
}

// ── In-memory devices with crash simulation ────────────────────────────────

struct MemImage {
    volatile: Vec<u8>,
    durable: Vec<u8>,
}

impl MemImage {
    fn new(len: usize) -> Self {
        Self {
            volatile: vec![0u8; len],
            durable: vec![0u8; len],
        }
    }

    fn from_durable(image: Vec<u8>) -> Self {
        Self {
            volatile: image.clone(),
            durable: image,
        }
    }
}

struct MemDevices {
    images: [MemImage; 3],
}

/// Handle onto a [`MemBackend`]'s images, used by tests to snapshot
/// durable state and rebuild a post-crash backend from it.
#[derive(Clone)]
pub struct MemHandle {
    inner: Arc<Mutex<MemDevices>>,
}

impl MemHandle {
    /// Durable (fdatasync'd) image of one device.
    #[must_use]
    pub fn durable_image(&self, dev: Device) -> Vec<u8> {
        self.inner.lock().images[dev.index()].durable.clone()
    }

    /// Volatile (written, possibly unsynced) image of one device.
    #[must_use]
    pub fn volatile_image(&self, dev: Device) -> Vec<u8> {
        self.inner.lock().images[dev.index()].volatile.clone()
    }

    /// Build a fresh backend from the current durable images, as if the
    /// process had crashed and the devices were reopened. Unsynced
    /// writes are lost.
    #[must_use]
    pub fn crash_and_reopen(&self) -> MemBackend {
        let guard = self.inner.lock();
        MemBackend::from_images(
            guard.images[0].durable.clone(),
            guard.images[1].durable.clone(),
            guard.images[2].durable.clone(),
        )
    }
}

/// In-memory backend with separate volatile and durable images per
/// device.
pub struct MemBackend {
    inner: Arc<Mutex<MemDevices>>,
}

impl MemBackend {
    /// Allocate zeroed devices of the given lengths.
    #[must_use]
    pub fn new(data_len: usize, meta_len: usize, journal_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemDevices {
                images: [
                    MemImage::new(data_len),
                    MemImage::new(meta_len),
                    MemImage::new(journal_len),
                ],
            })),
        }
    }

    /// Build devices whose volatile and durable state both equal the
    /// given images.
    #[must_use]
    pub fn from_images(data: Vec<u8>, meta: Vec<u8>, journal: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemDevices {
                images: [
                    MemImage::from_durable(data),
                    MemImage::from_durable(meta),
                    MemImage::from_durable(journal),
                ],
            })),
        }
    }

    #[must_use]
    pub fn handle(&self) -> MemHandle {
        MemHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RingBackend for MemBackend {
    fn run(&mut self, cmd: IoCmd) -> io::Result<IoOutcome> {
        let mut guard = self.inner.lock();
        match cmd {
            IoCmd::Read { dev, offset, len } => {
                let image = &guard.images[dev.index()].volatile;
                let start = offset as usize;
                let end = start + len as usize;
                if end > image.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of device",
                    ));
                }
                Ok(IoOutcome::Read(Bytes::copy_from_slice(&image[start..end])))
            }
            IoCmd::Write { dev, offset, data } => {
                let image = &mut guard.images[dev.index()].volatile;
                let start = offset as usize;
                let end = start + data.len();
                if end > image.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write past end of device",
                    ));
                }
                image[start..end].copy_from_slice(&data);
                Ok(IoOutcome::Done)
            }
            IoCmd::Fdatasync { dev } => {
                let image = &mut guard.images[dev.index()];
                image.durable.copy_from_slice(&image.volatile);
                Ok(IoOutcome::Done)
            }
        }
    }

    fn device_len(&self, dev: Device) -> u64 {
        self.inner.lock().images[dev.index()].volatile.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_ring(depth: usize) -> (Ring, MemHandle) {
        let backend = MemBackend::new(4096, 4096, 4096);
        let handle = backend.handle();
        (Ring::new(Box::new(backend), depth), handle)
    }

    #[test]
    fn test_stage_submit_poll() {
        let (mut ring, _) = mem_ring(8);

        assert!(ring.stage(
            1,
            IoCmd::Write {
                dev: Device::Data,
                offset: 0,
                data: Bytes::from(vec![0xAB; 512]),
            }
        ));
        assert!(ring.stage(
            2,
            IoCmd::Read {
                dev: Device::Data,
                offset: 0,
                len: 512,
            }
        ));
        assert_eq!(ring.submit(), 2);

        let c1 = ring.poll().unwrap();
        assert_eq!(c1.token, 1);
        let c2 = ring.poll().unwrap();
        assert_eq!(c2.token, 2);
        match c2.result.unwrap() {
            IoOutcome::Read(data) => assert!(data.iter().all(|&b| b == 0xAB)),
            IoOutcome::Done => panic!("expected read outcome"),
        }
        assert!(ring.poll().is_none());
    }

    #[test]
    fn test_ring_capacity_and_rollback() {
        let (mut ring, _) = mem_ring(2);

        let mark = ring.stage_mark();
        assert!(ring.stage(1, IoCmd::Fdatasync { dev: Device::Data }));
        assert!(ring.stage(2, IoCmd::Fdatasync { dev: Device::Data }));
        // Full: third stage fails, caller rolls back its partial batch.
        assert!(!ring.stage(3, IoCmd::Fdatasync { dev: Device::Data }));
        ring.unstage_to(mark);
        assert_eq!(ring.free_slots(), 2);
    }

    #[test]
    fn test_unharvested_completions_hold_slots() {
        let (mut ring, _) = mem_ring(2);
        ring.stage(1, IoCmd::Fdatasync { dev: Device::Data });
        ring.submit();
        assert_eq!(ring.free_slots(), 1);
        ring.poll().unwrap();
        assert_eq!(ring.free_slots(), 2);
    }

    #[test]
    fn test_durable_lags_volatile() {
        let (mut ring, handle) = mem_ring(8);

        ring.stage(
            1,
            IoCmd::Write {
                dev: Device::Journal,
                offset: 512,
                data: Bytes::from(vec![0x11; 512]),
            },
        );
        ring.submit();

        // Written but not synced: lost on crash.
        assert!(handle.durable_image(Device::Journal)[512..1024]
            .iter()
            .all(|&b| b == 0));

        ring.stage(2, IoCmd::Fdatasync { dev: Device::Journal });
        ring.submit();
        assert!(handle.durable_image(Device::Journal)[512..1024]
            .iter()
            .all(|&b| b == 0x11));
    }

    #[test]
    fn test_crash_and_reopen_discards_unsynced() {
        let (mut ring, handle) = mem_ring(8);

        ring.stage(
            1,
            IoCmd::Write {
                dev: Device::Data,
                offset: 0,
                data: Bytes::from(vec![0x22; 512]),
            },
        );
        ring.submit();

        let mut reopened = handle.crash_and_reopen();
        let out = reopened
            .run(IoCmd::Read {
                dev: Device::Data,
                offset: 0,
                len: 512,
            })
            .unwrap();
        match out {
            IoOutcome::Read(data) => assert!(data.iter().all(|&b| b == 0)),
            IoOutcome::Done => panic!("expected read outcome"),
        }
    }

    #[test]
    fn test_read_past_end() {
        let (mut ring, _) = mem_ring(8);
        ring.stage(
            1,
            IoCmd::Read {
                dev: Device::Meta,
                offset: 4096,
                len: 512,
            },
        );
        ring.submit();
        assert!(ring.poll().unwrap().result.is_err());
    }
}
