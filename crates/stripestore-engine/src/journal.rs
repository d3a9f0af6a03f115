//! Journal writer state
//!
//! The journal region is a byte ring: sector 0 holds the header
//! (recovery checkpoint), the rest cycles between 512-byte entry
//! sectors and write payloads. `used_start` (inclusive) and `next_free`
//! (exclusive) delimit the live region; a reservation that would run
//! into `used_start` parks the requesting operation until trim frees
//! space.
//!
//! Entries are assembled in a small fixed set of in-memory sector
//! buffers. A buffer's usage count tracks entries whose sector write
//! has not yet reached the device; the writer takes the next buffer
//! only once its usage count has dropped to zero, which bounds the
//! amount of dirty in-memory journal state.

use crate::layout::{encode_entry, JournalRecord, SECTOR_SIZE};
use bytes::Bytes;
use std::collections::BTreeMap;

/// One in-memory journal sector buffer.
struct SectorBuffer {
    buf: Vec<u8>,
    /// Ring offset this buffer is bound to.
    offset: u64,
    /// Fill position within the sector.
    in_pos: usize,
    /// Entries appended whose sector write has not completed yet.
    usage: u32,
}

/// Result of a space check for one entry (plus payload).
#[derive(Debug, PartialEq, Eq)]
pub enum SpaceCheck {
    /// The reservation fits right now.
    Fits,
    /// The next in-memory sector buffer is still unsynced.
    NeedBuffer,
    /// This many free ring bytes are required.
    NeedBytes(u64),
}

/// Where an appended entry landed.
#[derive(Debug)]
pub struct Appended {
    /// Index of the sector buffer holding the entry.
    pub sector: usize,
    /// Ring offset of that sector.
    pub sector_offset: u64,
    /// Ring offset of the payload, for entries that carry one.
    pub payload_offset: Option<u64>,
    /// CRC of the appended entry (the new chain tail).
    pub crc32: u32,
}

/// Journal ring cursors, CRC chain and sector buffers.
pub struct Journal {
    len: u64,
    pub used_start: u64,
    pub next_free: u64,
    pub crc32_last: u32,
    sectors: Vec<SectorBuffer>,
    cur_sector: usize,
    /// Ring offset of each live sector -> chain value at its start.
    /// Needed to restate the header checkpoint when trim advances.
    sector_crcs: BTreeMap<u64, u32>,
}

impl Journal {
    /// Fresh journal state over a ring of `len` bytes with
    /// `sector_count` in-memory buffers. Cursors start at the first
    /// data sector; the first append opens a new sector there.
    #[must_use]
    pub fn new(len: u64, sector_count: usize) -> Self {
        assert!(sector_count >= 2);
        let sectors = (0..sector_count)
            .map(|_| SectorBuffer {
                buf: vec![0u8; SECTOR_SIZE],
                offset: 0,
                // Marked full so the first append opens a fresh sector.
                in_pos: SECTOR_SIZE,
                usage: 0,
            })
            .collect();
        Self {
            len,
            used_start: SECTOR_SIZE as u64,
            next_free: SECTOR_SIZE as u64,
            crc32_last: 0,
            sectors,
            cur_sector: sector_count - 1,
            sector_crcs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used_start == self.next_free
    }

    /// Usable ring capacity (total minus the header sector).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.len - SECTOR_SIZE as u64
    }

    /// Forward ring distance from `from` to `to` within the data area.
    #[must_use]
    pub fn fwd_dist(&self, from: u64, to: u64) -> u64 {
        if to >= from {
            to - from
        } else {
            (self.len - from) + (to - SECTOR_SIZE as u64)
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.fwd_dist(self.used_start, self.next_free)
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.capacity() - self.used_bytes()
    }

    /// Check whether an entry (and its payload) can be reserved now.
    /// Consumption is accumulated through the same cursor moves the
    /// append would make, so slack skipped at the ring end counts too.
    #[must_use]
    pub fn check_space(&self, rec: &JournalRecord) -> SpaceCheck {
        let rec_size = rec.encoded_len();
        let payload = rec.payload_len() as u64;

        let mut nf = self.next_free;
        let mut consumed = 0u64;
        if self.sector_remaining() < rec_size {
            if self.sectors[self.next_sector_index()].usage > 0 {
                return SpaceCheck::NeedBuffer;
            }
            if self.len - nf < SECTOR_SIZE as u64 {
                consumed += self.len - nf;
                nf = SECTOR_SIZE as u64;
            }
            consumed += SECTOR_SIZE as u64;
            nf += SECTOR_SIZE as u64;
        }
        if payload > 0 {
            if self.len - nf < payload {
                consumed += self.len - nf;
                nf = SECTOR_SIZE as u64;
            }
            consumed += payload;
        }

        let need = consumed + SECTOR_SIZE as u64;
        if need > self.free_bytes() {
            return SpaceCheck::NeedBytes(need);
        }
        SpaceCheck::Fits
    }

    /// Append an entry (space must have been checked). Chains the CRC,
    /// reserves the payload bytes and bumps the sector usage count.
    pub fn append(&mut self, rec: &JournalRecord) -> Appended {
        let rec_size = rec.encoded_len();
        let payload = rec.payload_len() as u64;

        if self.sector_remaining() < rec_size {
            self.open_next_sector();
        }

        let (bytes, crc) = encode_entry(rec, self.crc32_last);
        let sector = &mut self.sectors[self.cur_sector];
        sector.buf[sector.in_pos..sector.in_pos + rec_size].copy_from_slice(&bytes);
        sector.in_pos += rec_size;
        sector.usage += 1;
        self.crc32_last = crc;

        let payload_offset = if payload > 0 {
            if self.len - self.next_free < payload {
                self.next_free = SECTOR_SIZE as u64;
            }
            let off = self.next_free;
            self.next_free += payload;
            Some(off)
        } else {
            None
        };

        Appended {
            sector: self.cur_sector,
            sector_offset: self.sectors[self.cur_sector].offset,
            payload_offset,
            crc32: crc,
        }
    }

    /// Snapshot of one sector buffer for staging a device write.
    #[must_use]
    pub fn sector_snapshot(&self, sector: usize) -> (u64, Bytes) {
        let s = &self.sectors[sector];
        (s.offset, Bytes::copy_from_slice(&s.buf))
    }

    /// True when the next sector buffer in rotation is reusable.
    #[must_use]
    pub fn next_buffer_free(&self) -> bool {
        self.sectors[self.next_sector_index()].usage == 0
    }

    /// A write of this sector reached the device; one append's claim
    /// on the in-memory buffer is released.
    pub fn decrement_usage(&mut self, sector: usize) {
        let s = &mut self.sectors[sector];
        debug_assert!(s.usage > 0);
        s.usage = s.usage.saturating_sub(1);
    }

    /// Advance the trim cursor. `new_start` must be the ring position
    /// of a live sector (or `next_free` when nothing remains live).
    pub fn trim_to(&mut self, new_start: u64) {
        self.used_start = new_start;
        if self.is_empty() {
            // The cursor moved past the current sector's position; the
            // next entry must open a fresh sector inside the live
            // region, or recovery would never reach it.
            self.sectors[self.cur_sector].in_pos = SECTOR_SIZE;
        }
        let used = self.used_bytes();
        let len = self.len;
        let start = self.used_start;
        self.sector_crcs.retain(|&off, _| {
            let dist = if off >= start {
                off - start
            } else {
                (len - start) + (off - SECTOR_SIZE as u64)
            };
            dist < used
        });
    }

    /// Chain value at the start of the sector at `offset`, recorded
    /// when the sector was opened. Used to restate the header
    /// checkpoint on trim.
    #[must_use]
    pub fn start_crc_for(&self, offset: u64) -> Option<u32> {
        self.sector_crcs.get(&offset).copied()
    }

    /// Record a sector-start chain value (recovery replay).
    pub fn note_sector_start(&mut self, offset: u64, crc: u32) {
        self.sector_crcs.insert(offset, crc);
    }

    fn sector_remaining(&self) -> usize {
        SECTOR_SIZE - self.sectors[self.cur_sector].in_pos
    }

    fn next_sector_index(&self) -> usize {
        (self.cur_sector + 1) % self.sectors.len()
    }

    fn open_next_sector(&mut self) {
        self.cur_sector = self.next_sector_index();
        if self.len - self.next_free < SECTOR_SIZE as u64 {
            self.next_free = SECTOR_SIZE as u64;
        }
        let offset = self.next_free;
        self.next_free += SECTOR_SIZE as u64;
        self.sector_crcs.insert(offset, self.crc32_last);

        let sector = &mut self.sectors[self.cur_sector];
        sector.offset = offset;
        sector.in_pos = 0;
        sector.usage = 0;
        sector.buf.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripestore_common::ObjectId;

    fn small(len: u32) -> JournalRecord {
        JournalRecord::SmallWrite {
            oid: ObjectId::new(1, 0),
            version: 1,
            offset: 0,
            len,
        }
    }

    #[test]
    fn test_first_append_opens_sector() {
        let mut journal = Journal::new(64 * 1024, 4);
        assert!(journal.is_empty());

        let rec = small(512);
        assert_eq!(journal.check_space(&rec), SpaceCheck::Fits);
        let appended = journal.append(&rec);

        assert_eq!(appended.sector_offset, 512);
        assert_eq!(appended.payload_offset, Some(1024));
        assert_eq!(journal.next_free, 1536);
        assert_eq!(journal.used_bytes(), 1024);
        assert_eq!(journal.crc32_last, appended.crc32);
    }

    #[test]
    fn test_entries_pack_into_one_sector() {
        let mut journal = Journal::new(64 * 1024, 4);
        let a = journal.append(&small(512));
        let b = journal.append(&small(512));
        assert_eq!(a.sector, b.sector);
        assert_eq!(a.sector_offset, b.sector_offset);
        // Payloads are placed in append order after the sector.
        assert_eq!(b.payload_offset, Some(a.payload_offset.unwrap() + 512));
    }

    #[test]
    fn test_sector_rollover() {
        let mut journal = Journal::new(64 * 1024, 4);
        // 56-byte small-write entries: 9 fit in a sector, the 10th
        // opens a new one.
        let first = journal.append(&small(512));
        for _ in 0..8 {
            journal.append(&small(512));
        }
        let tenth = journal.append(&small(512));
        assert_ne!(first.sector, tenth.sector);
        assert!(tenth.sector_offset > first.sector_offset);
    }

    #[test]
    fn test_buffer_backpressure() {
        let mut journal = Journal::new(64 * 1024, 2);
        let first = journal.append(&small(512));
        for _ in 0..8 {
            journal.append(&small(512));
        }
        // Both buffers carry entries whose writes have not completed;
        // rotating back to the first one must wait.
        for _ in 0..9 {
            journal.append(&small(512));
        }
        assert_eq!(journal.check_space(&small(512)), SpaceCheck::NeedBuffer);

        for _ in 0..9 {
            journal.decrement_usage(first.sector);
        }
        assert_eq!(journal.check_space(&small(512)), SpaceCheck::Fits);
    }

    #[test]
    fn test_journal_fills_up() {
        let mut journal = Journal::new(8 * 1024, 4);
        let rec = small(512);
        let mut appended = 0;
        while journal.check_space(&rec) == SpaceCheck::Fits {
            let a = journal.append(&rec);
            journal.decrement_usage(a.sector);
            appended += 1;
        }
        assert!(appended > 0);
        assert!(matches!(
            journal.check_space(&rec),
            SpaceCheck::NeedBytes(_)
        ));
    }

    #[test]
    fn test_trim_frees_space() {
        let mut journal = Journal::new(8 * 1024, 4);
        let rec = small(512);
        while journal.check_space(&rec) == SpaceCheck::Fits {
            let a = journal.append(&rec);
            journal.decrement_usage(a.sector);
        }
        let before = journal.free_bytes();
        journal.trim_to(journal.next_free);
        assert!(journal.is_empty());
        assert!(journal.free_bytes() > before);
    }

    #[test]
    fn test_wrap_around() {
        let mut journal = Journal::new(8 * 1024, 4);
        let rec = small(1024);
        // Fill, trim everything, keep appending: cursors must wrap back
        // into the low part of the ring without touching the header
        // sector.
        for _ in 0..16 {
            while journal.check_space(&rec) != SpaceCheck::Fits {
                journal.trim_to(journal.next_free);
            }
            let appended = journal.append(&rec);
            journal.decrement_usage(appended.sector);
            assert!(appended.sector_offset >= 512);
            assert!(appended.payload_offset.unwrap() >= 512);
            assert!(appended.payload_offset.unwrap() + 1024 <= 8 * 1024);
        }
    }

    #[test]
    fn test_sector_crc_tracking() {
        let mut journal = Journal::new(64 * 1024, 4);
        let first = journal.append(&small(512));
        assert_eq!(journal.start_crc_for(first.sector_offset), Some(0));

        for _ in 0..9 {
            journal.append(&small(512));
        }
        let later = journal.append(&small(512));
        // The later sector's start value chains from entries before it.
        let start = journal.start_crc_for(later.sector_offset).unwrap();
        assert_ne!(start, 0);

        journal.trim_to(later.sector_offset);
        assert_eq!(journal.start_crc_for(first.sector_offset), None);
        assert_eq!(journal.start_crc_for(later.sector_offset), Some(start));
    }
}
