//! On-disk formats
//!
//! Layout of one store (regions may live on one device or three):
//!
//! ```text
//! +--------------------+
//! |  Journal region    |  512B header sector + ring of entry sectors
//! |                    |  and write payloads
//! +--------------------+
//! |  Metadata region   |  dense array of 32-byte clean entries,
//! |                    |  entry position = data block index
//! +--------------------+
//! |  Data region       |  object blocks of uniform block_size
//! +--------------------+
//! ```
//!
//! Journal entries share a 24-byte header `{crc32, magic, type, size,
//! crc32_prev, reserved}`; `crc32` is computed over the whole entry
//! with the crc field zeroed, and `crc32_prev` chains it to the
//! previous entry, forming an unbroken linked list from the header
//! checkpoint to the journal tail. All fields are little-endian.
//! Entries never cross a sector boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stripestore_common::{Error, ObjVer, ObjectId, Result};

/// Journal entry magic ("STRJ").
pub const JOURNAL_MAGIC: u32 = 0x4A52_5453;

/// Journal header magic ("STRH").
pub const JOURNAL_HEADER_MAGIC: u32 = 0x4852_5453;

/// Journal format version.
pub const JOURNAL_VERSION: u32 = 1;

/// Journal metadata sector size. Entries never cross a sector boundary.
pub const SECTOR_SIZE: usize = 512;

/// Common journal entry header length.
pub const ENTRY_HEADER_SIZE: usize = 24;

/// On-disk clean metadata entry length.
pub const CLEAN_ENTRY_SIZE: usize = 32;

/// Clean entry flag: entry is live.
pub const CLEAN_FLAG_LIVE: u8 = 1;

/// Entry type codes.
pub const JE_SMALL_WRITE: u32 = 1;
pub const JE_BIG_WRITE: u32 = 2;
pub const JE_DELETE: u32 = 3;
pub const JE_SYNC: u32 = 4;
pub const JE_STABLE: u32 = 5;
pub const JE_ROLLBACK: u32 = 6;

/// Most (oid, version) pairs one STABLE/ROLLBACK entry can carry
/// without crossing a sector boundary.
pub const MAX_BATCH_PER_ENTRY: usize = (SECTOR_SIZE - ENTRY_HEADER_SIZE - 4) / 24;

/// Journal region header, stored in the first sector.
///
/// `start_offset`/`start_crc32` are the recovery checkpoint: the ring
/// position of the oldest live entry and the chain value its
/// `crc32_prev` must match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalHeader {
    pub start_offset: u64,
    pub start_crc32: u32,
}

impl JournalHeader {
    /// Byte length of the meaningful header prefix (the rest of the
    /// sector is zero padding).
    const ENCODED_LEN: usize = 24;

    /// Serialize into a full zero-padded sector.
    #[must_use]
    pub fn to_sector(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SECTOR_SIZE);
        buf.put_u32_le(JOURNAL_HEADER_MAGIC);
        buf.put_u32_le(JOURNAL_VERSION);
        buf.put_u32_le(0); // crc32 placeholder
        buf.put_u64_le(self.start_offset);
        buf.put_u32_le(self.start_crc32);
        let crc = crc32c::crc32c(&buf[..Self::ENCODED_LEN]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf.resize(SECTOR_SIZE, 0);
        buf.freeze()
    }

    /// Parse and validate a header sector.
    pub fn from_sector(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LEN {
            return Err(Error::corruption("journal header sector too short"));
        }
        let mut buf = &data[..];
        let magic = buf.get_u32_le();
        if magic != JOURNAL_HEADER_MAGIC {
            return Err(Error::corruption("bad journal header magic"));
        }
        let version = buf.get_u32_le();
        if version != JOURNAL_VERSION {
            return Err(Error::corruption(format!(
                "unsupported journal version {version}"
            )));
        }
        let stored_crc = buf.get_u32_le();
        let start_offset = buf.get_u64_le();
        let start_crc32 = buf.get_u32_le();

        let mut check = data[..Self::ENCODED_LEN].to_vec();
        check[8..12].fill(0);
        if crc32c::crc32c(&check) != stored_crc {
            return Err(Error::corruption("journal header crc mismatch"));
        }

        Ok(Self {
            start_offset,
            start_crc32,
        })
    }
}

/// Typed journal entry body.
///
/// SMALL_WRITE payload bytes are not part of the entry; they are placed
/// at the journal's running payload cursor, which the replayer derives
/// by mirroring the writer's allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalRecord {
    SmallWrite {
        oid: ObjectId,
        version: u64,
        offset: u32,
        len: u32,
    },
    BigWrite {
        oid: ObjectId,
        version: u64,
        location: u64,
    },
    Delete {
        oid: ObjectId,
        version: u64,
    },
    Sync,
    Stable {
        versions: Vec<ObjVer>,
    },
    Rollback {
        versions: Vec<ObjVer>,
    },
}

impl JournalRecord {
    #[must_use]
    pub fn type_code(&self) -> u32 {
        match self {
            Self::SmallWrite { .. } => JE_SMALL_WRITE,
            Self::BigWrite { .. } => JE_BIG_WRITE,
            Self::Delete { .. } => JE_DELETE,
            Self::Sync => JE_SYNC,
            Self::Stable { .. } => JE_STABLE,
            Self::Rollback { .. } => JE_ROLLBACK,
        }
    }

    /// Total encoded entry length, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE
            + match self {
                Self::SmallWrite { .. } => 16 + 8 + 4 + 4,
                Self::BigWrite { .. } => 16 + 8 + 8,
                Self::Delete { .. } => 16 + 8,
                Self::Sync => 0,
                Self::Stable { versions } | Self::Rollback { versions } => 4 + versions.len() * 24,
            }
    }

    /// Length of the payload following this entry in the journal.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::SmallWrite { len, .. } => *len as usize,
            _ => 0,
        }
    }
}

/// Encode an entry, chaining it to `crc32_prev`. Returns the entry
/// bytes and its crc32 (the new chain tail).
#[must_use]
pub fn encode_entry(rec: &JournalRecord, crc32_prev: u32) -> (Bytes, u32) {
    let size = rec.encoded_len();
    debug_assert!(size <= SECTOR_SIZE);

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32_le(0); // crc32 placeholder
    buf.put_u32_le(JOURNAL_MAGIC);
    buf.put_u32_le(rec.type_code());
    buf.put_u32_le(size as u32);
    buf.put_u32_le(crc32_prev);
    buf.put_u32_le(0); // reserved

    match rec {
        JournalRecord::SmallWrite {
            oid,
            version,
            offset,
            len,
        } => {
            put_oid(&mut buf, oid);
            buf.put_u64_le(*version);
            buf.put_u32_le(*offset);
            buf.put_u32_le(*len);
        }
        JournalRecord::BigWrite {
            oid,
            version,
            location,
        } => {
            put_oid(&mut buf, oid);
            buf.put_u64_le(*version);
            buf.put_u64_le(*location);
        }
        JournalRecord::Delete { oid, version } => {
            put_oid(&mut buf, oid);
            buf.put_u64_le(*version);
        }
        JournalRecord::Sync => {}
        JournalRecord::Stable { versions } | JournalRecord::Rollback { versions } => {
            buf.put_u32_le(versions.len() as u32);
            for ov in versions {
                put_oid(&mut buf, &ov.oid);
                buf.put_u64_le(ov.version);
            }
        }
    }

    let crc = crc32c::crc32c(&buf);
    buf[0..4].copy_from_slice(&crc.to_le_bytes());
    (buf.freeze(), crc)
}

/// A decoded journal entry with its chain fields.
#[derive(Debug)]
pub struct ParsedEntry {
    pub record: JournalRecord,
    pub crc32: u32,
    pub crc32_prev: u32,
    pub size: usize,
}

/// Outcome of parsing the bytes at one in-sector position.
#[derive(Debug)]
pub enum EntryParse {
    /// No entry here (zero padding after the last entry of a sector).
    None,
    /// A structurally valid entry whose self-CRC checks out.
    Entry(ParsedEntry),
}

/// Parse the entry starting at `buf[0]`, if any.
///
/// Returns `EntryParse::None` when the magic does not match (end of the
/// entries in this sector), and an error when the bytes carry the entry
/// magic but fail structural or CRC validation (a torn or stale entry -
/// the journal walk ends here).
pub fn parse_entry(buf: &[u8]) -> Result<EntryParse> {
    if buf.len() < ENTRY_HEADER_SIZE {
        return Ok(EntryParse::None);
    }
    let mut hdr = &buf[..ENTRY_HEADER_SIZE];
    let crc32 = hdr.get_u32_le();
    let magic = hdr.get_u32_le();
    if magic != JOURNAL_MAGIC {
        return Ok(EntryParse::None);
    }
    let type_code = hdr.get_u32_le();
    let size = hdr.get_u32_le() as usize;
    let crc32_prev = hdr.get_u32_le();

    if size < ENTRY_HEADER_SIZE || size > SECTOR_SIZE || size > buf.len() {
        return Err(Error::corruption(format!("bad journal entry size {size}")));
    }

    let mut check = buf[..size].to_vec();
    check[0..4].fill(0);
    if crc32c::crc32c(&check) != crc32 {
        return Err(Error::corruption("journal entry crc mismatch"));
    }

    let mut body = &buf[ENTRY_HEADER_SIZE..size];
    let record = match type_code {
        JE_SMALL_WRITE => {
            check_body_len(body.len(), 32, "SMALL_WRITE")?;
            let oid = get_oid(&mut body);
            let version = body.get_u64_le();
            let offset = body.get_u32_le();
            let len = body.get_u32_le();
            JournalRecord::SmallWrite {
                oid,
                version,
                offset,
                len,
            }
        }
        JE_BIG_WRITE => {
            check_body_len(body.len(), 32, "BIG_WRITE")?;
            let oid = get_oid(&mut body);
            let version = body.get_u64_le();
            let location = body.get_u64_le();
            JournalRecord::BigWrite {
                oid,
                version,
                location,
            }
        }
        JE_DELETE => {
            check_body_len(body.len(), 24, "DELETE")?;
            let oid = get_oid(&mut body);
            let version = body.get_u64_le();
            JournalRecord::Delete { oid, version }
        }
        JE_SYNC => JournalRecord::Sync,
        JE_STABLE | JE_ROLLBACK => {
            if body.len() < 4 {
                return Err(Error::corruption("truncated STABLE/ROLLBACK entry"));
            }
            let count = body.get_u32_le() as usize;
            check_body_len(body.len(), count * 24, "STABLE/ROLLBACK")?;
            let mut versions = Vec::with_capacity(count);
            for _ in 0..count {
                let oid = get_oid(&mut body);
                let version = body.get_u64_le();
                versions.push(ObjVer::new(oid, version));
            }
            if type_code == JE_STABLE {
                JournalRecord::Stable { versions }
            } else {
                JournalRecord::Rollback { versions }
            }
        }
        other => {
            return Err(Error::corruption(format!(
                "unknown journal entry type {other}"
            )));
        }
    };

    Ok(EntryParse::Entry(ParsedEntry {
        record,
        crc32,
        crc32_prev,
        size,
    }))
}

fn check_body_len(have: usize, need: usize, what: &str) -> Result<()> {
    if have < need {
        return Err(Error::corruption(format!("truncated {what} entry")));
    }
    Ok(())
}

fn put_oid(buf: &mut BytesMut, oid: &ObjectId) {
    buf.put_u64_le(oid.inode);
    buf.put_u64_le(oid.stripe);
}

fn get_oid(buf: &mut &[u8]) -> ObjectId {
    let inode = buf.get_u64_le();
    let stripe = buf.get_u64_le();
    ObjectId::new(inode, stripe)
}

/// Encode a live clean metadata entry.
#[must_use]
pub fn encode_clean_entry(oid: ObjectId, version: u64) -> [u8; CLEAN_ENTRY_SIZE] {
    let mut out = [0u8; CLEAN_ENTRY_SIZE];
    out[0..8].copy_from_slice(&oid.inode.to_le_bytes());
    out[8..16].copy_from_slice(&oid.stripe.to_le_bytes());
    out[16..24].copy_from_slice(&version.to_le_bytes());
    out[24] = CLEAN_FLAG_LIVE;
    out
}

/// Decode one clean metadata entry. All-zero means a free slot.
pub fn decode_clean_entry(buf: &[u8]) -> Result<Option<(ObjectId, u64)>> {
    if buf.len() < CLEAN_ENTRY_SIZE {
        return Err(Error::corruption("short clean metadata entry"));
    }
    if buf[..CLEAN_ENTRY_SIZE].iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let flags = buf[24];
    if flags != CLEAN_FLAG_LIVE {
        return Err(Error::corruption(format!(
            "bad clean entry flags {flags:#x}"
        )));
    }
    let inode = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let stripe = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let version = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    Ok(Some((ObjectId::new(inode, stripe), version)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = JournalHeader {
            start_offset: 512,
            start_crc32: 0xDEAD_BEEF,
        };
        let sector = hdr.to_sector();
        assert_eq!(sector.len(), SECTOR_SIZE);
        let parsed = JournalHeader::from_sector(&sector).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_header_crc_detects_flip() {
        let mut sector = JournalHeader {
            start_offset: 512,
            start_crc32: 7,
        }
        .to_sector()
        .to_vec();
        sector[12] ^= 0xFF;
        assert!(JournalHeader::from_sector(&sector).is_err());
    }

    #[test]
    fn test_entry_chain() {
        let oid = ObjectId::new(3, 0x40);
        let rec1 = JournalRecord::SmallWrite {
            oid,
            version: 1,
            offset: 0,
            len: 4096,
        };
        let (bytes1, crc1) = encode_entry(&rec1, 0);
        let rec2 = JournalRecord::Delete { oid, version: 2 };
        let (bytes2, crc2) = encode_entry(&rec2, crc1);
        assert_ne!(crc1, crc2);

        match parse_entry(&bytes1).unwrap() {
            EntryParse::Entry(pe) => {
                assert_eq!(pe.record, rec1);
                assert_eq!(pe.crc32_prev, 0);
                assert_eq!(pe.crc32, crc1);
            }
            EntryParse::None => panic!("entry expected"),
        }
        match parse_entry(&bytes2).unwrap() {
            EntryParse::Entry(pe) => {
                assert_eq!(pe.record, rec2);
                assert_eq!(pe.crc32_prev, crc1);
            }
            EntryParse::None => panic!("entry expected"),
        }
    }

    #[test]
    fn test_entry_sizes() {
        let oid = ObjectId::new(1, 0);
        assert_eq!(
            JournalRecord::SmallWrite {
                oid,
                version: 1,
                offset: 0,
                len: 512
            }
            .encoded_len(),
            56
        );
        assert_eq!(
            JournalRecord::BigWrite {
                oid,
                version: 1,
                location: 0
            }
            .encoded_len(),
            56
        );
        assert_eq!(JournalRecord::Delete { oid, version: 1 }.encoded_len(), 48);
        assert_eq!(JournalRecord::Sync.encoded_len(), 24);
        assert_eq!(
            JournalRecord::Stable {
                versions: vec![ObjVer::new(oid, 1); 3]
            }
            .encoded_len(),
            24 + 4 + 72
        );
    }

    #[test]
    fn test_parse_zero_padding_is_none() {
        let zeros = [0u8; SECTOR_SIZE];
        assert!(matches!(parse_entry(&zeros).unwrap(), EntryParse::None));
    }

    #[test]
    fn test_parse_torn_entry_is_error() {
        let (bytes, _) = encode_entry(
            &JournalRecord::Delete {
                oid: ObjectId::new(1, 0),
                version: 1,
            },
            0,
        );
        let mut torn = bytes.to_vec();
        torn[30] ^= 0x01;
        assert!(parse_entry(&torn).is_err());
    }

    #[test]
    fn test_stable_batch_roundtrip() {
        let versions: Vec<ObjVer> = (1..=5)
            .map(|v| ObjVer::new(ObjectId::new(v, 0x10), v * 7))
            .collect();
        let (bytes, _) = encode_entry(
            &JournalRecord::Stable {
                versions: versions.clone(),
            },
            42,
        );
        match parse_entry(&bytes).unwrap() {
            EntryParse::Entry(pe) => {
                assert_eq!(pe.record, JournalRecord::Stable { versions });
            }
            EntryParse::None => panic!("entry expected"),
        }
    }

    #[test]
    fn test_clean_entry_roundtrip() {
        let oid = ObjectId::new(9, 0x31);
        let encoded = encode_clean_entry(oid, 12);
        let (got_oid, got_ver) = decode_clean_entry(&encoded).unwrap().unwrap();
        assert_eq!(got_oid, oid);
        assert_eq!(got_ver, 12);

        assert!(decode_clean_entry(&[0u8; CLEAN_ENTRY_SIZE])
            .unwrap()
            .is_none());

        let mut bad = encoded;
        bad[24] = 0x7F;
        assert!(decode_clean_entry(&bad).is_err());
    }
}
