//! Startup recovery
//!
//! The metadata region is scanned first to rebuild the clean index and
//! the block allocator, then the journal is walked forward from the
//! header checkpoint. Every accepted entry must chain: its `crc32_prev`
//! equals the CRC of the previous accepted entry, starting from the
//! checkpoint value. Entries are replayed into the dirty index as if
//! their device I/O had just completed and been synced - anything the
//! walk reaches lies before the fdatasync that landed the entry, so its
//! payload is durable too.
//!
//! The walk ends at the first entry that fails a magic, chain or CRC
//! check: a torn tail from a crash, discarded with a warning. A corrupt
//! journal *header* or unreadable metadata is fatal instead - the store
//! refuses to run on partial state.
//!
//! SMALL_WRITE entries carry no payload location; the replayer mirrors
//! the writer's payload allocation (append order, wrap at the ring end)
//! to derive it.

use crate::layout::{
    decode_clean_entry, parse_entry, EntryParse, JournalHeader, JournalRecord, CLEAN_ENTRY_SIZE,
    ENTRY_HEADER_SIZE, SECTOR_SIZE,
};
use crate::ring::{Device, IoCmd, IoOutcome};
use crate::store::{Blockstore, CleanEntry, DirtyEntry, DirtyState, WriteKind};
use stripestore_common::{Error, ObjVer, Result};
use tracing::{debug, info, warn};

impl Blockstore {
    pub(crate) fn recover(&mut self) -> Result<()> {
        self.load_metadata()?;
        let replayed = self.replay_journal()?;

        // Versions the caller had stabilized resume their movement. A
        // synced-but-unstabilized deletion is durable yet still waits
        // for its acknowledgement, so it stays put.
        let stable: Vec<ObjVer> = self
            .dirty
            .iter()
            .filter(|(_, de)| {
                matches!(
                    de.state,
                    DirtyState::JStable | DirtyState::DStable | DirtyState::DelStable
                )
            })
            .map(|(ov, _)| *ov)
            .collect();
        for ov in stable {
            self.flush_queue.push_back(ov);
        }

        info!(
            clean = self.clean.len(),
            dirty = self.dirty.len(),
            journal_entries = replayed,
            used_start = self.journal.used_start,
            next_free = self.journal.next_free,
            "recovery complete"
        );
        Ok(())
    }

    /// Scan the metadata table into memory and rebuild the clean index.
    fn load_metadata(&mut self) -> Result<()> {
        let meta_len = self.geo.meta_len;
        let chunk = 64 * 1024u64;
        let mut off = 0u64;
        while off < meta_len {
            let n = chunk.min(meta_len - off);
            let out = self.ring.run_direct(IoCmd::Read {
                dev: Device::Meta,
                offset: self.meta_dev_off(off),
                len: n as u32,
            })?;
            let IoOutcome::Read(data) = out else {
                unreachable!("read returns data");
            };
            self.meta_image[off as usize..(off + n) as usize].copy_from_slice(&data);
            off += n;
        }

        for block in 0..self.geo.block_count {
            let slot = (block as usize) * CLEAN_ENTRY_SIZE;
            let Some((oid, version)) = decode_clean_entry(&self.meta_image[slot..])? else {
                continue;
            };
            match self.clean.get(&oid).copied() {
                Some(existing) if existing.version >= version => {
                    // Superseded entry from an interrupted promotion;
                    // its block stays free.
                    warn!(%oid, version, "stale duplicate clean entry ignored");
                }
                Some(existing) => {
                    self.data_alloc.set(existing.block, false);
                    self.clean.insert(oid, CleanEntry { version, block });
                    self.data_alloc.set(block, true);
                }
                None => {
                    self.clean.insert(oid, CleanEntry { version, block });
                    self.data_alloc.set(block, true);
                    *self.inode_stats.entry(oid.inode).or_insert(0) +=
                        u64::from(self.cfg.block_size);
                }
            }
        }
        Ok(())
    }

    /// Walk the journal from the checkpoint, replaying accepted entries
    /// into the dirty index. Returns the number of entries accepted.
    fn replay_journal(&mut self) -> Result<usize> {
        let len = self.cfg.journal_len;
        let out = self.ring.run_direct(IoCmd::Read {
            dev: Device::Journal,
            offset: self.journal_dev_off(0),
            len: SECTOR_SIZE as u32,
        })?;
        let IoOutcome::Read(head) = out else {
            unreachable!("read returns data");
        };
        let header = JournalHeader::from_sector(&head)?;

        let start = header.start_offset;
        if start < SECTOR_SIZE as u64 || start >= len || start % SECTOR_SIZE as u64 != 0 {
            return Err(Error::corruption(format!(
                "journal start offset {start} out of bounds"
            )));
        }

        let mut chain = header.start_crc32;
        let mut pos = start;
        let mut last_end = start;
        let mut total = 0usize;
        let mut stop = false;

        loop {
            if len - pos < SECTOR_SIZE as u64 {
                pos = SECTOR_SIZE as u64;
            }
            let out = self.ring.run_direct(IoCmd::Read {
                dev: Device::Journal,
                offset: self.journal_dev_off(pos),
                len: SECTOR_SIZE as u32,
            })?;
            let IoOutcome::Read(sector) = out else {
                unreachable!("read returns data");
            };

            let sector_chain = chain;
            let mut in_pos = 0usize;
            let mut next_free = pos + SECTOR_SIZE as u64;
            let mut accepted = 0usize;

            while in_pos + ENTRY_HEADER_SIZE <= SECTOR_SIZE {
                match parse_entry(&sector[in_pos..]) {
                    Ok(EntryParse::None) => break,
                    Err(e) => {
                        warn!(pos, in_pos, error = %e, "journal tail discarded");
                        stop = true;
                        break;
                    }
                    Ok(EntryParse::Entry(pe)) => {
                        if pe.crc32_prev != chain {
                            if in_pos > 0 {
                                warn!(pos, in_pos, "journal chain breaks mid-sector");
                            }
                            stop = true;
                            break;
                        }
                        chain = pe.crc32;
                        let payload_len = pe.record.payload_len() as u64;
                        let payload_off = if payload_len > 0 {
                            if len - next_free < payload_len {
                                next_free = SECTOR_SIZE as u64;
                            }
                            let off = next_free;
                            next_free += payload_len;
                            Some(off)
                        } else {
                            None
                        };
                        self.apply_record(&pe.record, payload_off, pos);
                        in_pos += pe.size;
                        accepted += 1;
                    }
                }
            }

            if accepted > 0 {
                self.journal.note_sector_start(pos, sector_chain);
                last_end = next_free;
                total += accepted;
            }
            if stop || accepted == 0 {
                break;
            }
            pos = next_free;
            if len - pos < SECTOR_SIZE as u64 {
                pos = SECTOR_SIZE as u64;
            }
            if pos == start {
                // Full lap; nothing more to read.
                break;
            }
        }

        self.journal.used_start = start;
        self.journal.next_free = last_end;
        self.journal.crc32_last = chain;
        Ok(total)
    }

    /// Replay one accepted entry as if its I/O had just completed and
    /// been synced.
    fn apply_record(&mut self, rec: &JournalRecord, payload_off: Option<u64>, sector_off: u64) {
        match rec {
            JournalRecord::SmallWrite {
                oid,
                version,
                offset,
                len,
            } => {
                if self.clean_version_at_least(oid, *version) {
                    return;
                }
                self.dirty.insert(
                    ObjVer::new(*oid, *version),
                    DirtyEntry {
                        state: DirtyState::JSynced,
                        kind: WriteKind::Small,
                        location: payload_off.expect("small write carries a payload"),
                        offset: *offset,
                        len: *len,
                        journal_block: Some(sector_off),
                    },
                );
            }
            JournalRecord::BigWrite {
                oid,
                version,
                location,
            } => {
                if self.clean_version_at_least(oid, *version) {
                    return;
                }
                let block = location >> self.cfg.block_order;
                if block >= self.geo.block_count {
                    warn!(%oid, version, location, "big-write location out of range, skipped");
                    return;
                }
                self.dirty.insert(
                    ObjVer::new(*oid, *version),
                    DirtyEntry {
                        state: DirtyState::DMetaSynced,
                        kind: WriteKind::Big,
                        location: *location,
                        offset: 0,
                        len: self.cfg.block_size,
                        journal_block: Some(sector_off),
                    },
                );
                self.data_alloc.set(block, true);
            }
            JournalRecord::Delete { oid, version } => {
                if self.clean_version_at_least(oid, *version) {
                    return;
                }
                self.dirty.insert(
                    ObjVer::new(*oid, *version),
                    DirtyEntry {
                        state: DirtyState::DelSynced,
                        kind: WriteKind::Delete,
                        location: 0,
                        offset: 0,
                        len: self.cfg.block_size,
                        journal_block: Some(sector_off),
                    },
                );
            }
            JournalRecord::Sync => {}
            JournalRecord::Stable { versions } => {
                for ov in versions {
                    let Some(de) = self.dirty.get_mut(ov) else {
                        // Already moved and trimmed; nothing to upgrade.
                        continue;
                    };
                    de.state = match de.state {
                        DirtyState::JSynced => DirtyState::JStable,
                        DirtyState::DMetaSynced => DirtyState::DStable,
                        DirtyState::DelSynced => DirtyState::DelStable,
                        other => other,
                    };
                    debug!(%ov, "replayed stable marker");
                }
            }
            JournalRecord::Rollback { versions } => {
                for ov in versions {
                    if let Some(de) = self.dirty.remove(ov) {
                        if de.kind == WriteKind::Big {
                            self.data_alloc
                                .set(de.location >> self.cfg.block_order, false);
                        }
                        debug!(%ov, "replayed rollback");
                    }
                }
            }
        }
    }

    fn clean_version_at_least(&self, oid: &stripestore_common::ObjectId, version: u64) -> bool {
        self.clean
            .get(oid)
            .map(|c| c.version >= version)
            .unwrap_or(false)
    }
}
