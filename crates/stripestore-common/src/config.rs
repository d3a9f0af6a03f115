//! Engine configuration
//!
//! The engine is configured from a flat key-value string map, the way
//! an OSD process hands down its per-device section. Recognized keys:
//!
//! | key                           | default        |
//! |-------------------------------|----------------|
//! | `data_device`                 | required       |
//! | `meta_device`                 | = data_device  |
//! | `journal_device`              | = data_device  |
//! | `block_size` / `block_order`  | 128 KiB / 17   |
//! | `journal_len`                 | 16 MiB         |
//! | `data_offset`                 | 0              |
//! | `meta_offset`                 | 0              |
//! | `journal_offset`              | 0              |
//! | `disk_alignment`              | 512            |
//! | `journal_sector_buffer_count` | 32             |
//!
//! Unknown keys are rejected so that a typo in an option name fails
//! loudly instead of silently running with a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default object block order (128 KiB blocks).
pub const DEFAULT_BLOCK_ORDER: u32 = 17;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024 * 1024;

/// Default journal region length.
pub const DEFAULT_JOURNAL_LEN: u64 = 16 * 1024 * 1024;

/// Default write alignment.
pub const DEFAULT_DISK_ALIGNMENT: u32 = 512;

/// Default number of in-memory journal sector buffers.
pub const DEFAULT_SECTOR_BUFFER_COUNT: usize = 32;

/// Parsed and validated engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Device (or file) holding the data region.
    pub data_device: PathBuf,
    /// Device holding the metadata region. May coincide with `data_device`.
    pub meta_device: PathBuf,
    /// Device holding the journal region. May coincide with `data_device`.
    pub journal_device: PathBuf,
    /// log2 of the object block size.
    pub block_order: u32,
    /// Object block size in bytes (`1 << block_order`).
    pub block_size: u32,
    /// Byte offset of the data region on `data_device`.
    pub data_offset: u64,
    /// Byte offset of the metadata region on `meta_device`.
    pub meta_offset: u64,
    /// Byte offset of the journal region on `journal_device`.
    pub journal_offset: u64,
    /// Journal region length in bytes, including the header sector.
    pub journal_len: u64,
    /// Required write alignment in bytes.
    pub disk_alignment: u32,
    /// Number of in-memory 512-byte journal sector buffers.
    pub journal_sector_buffer_count: usize,
}

impl StoreConfig {
    /// Parse a configuration from a key-value string map.
    ///
    /// Every key must be recognized; `data_device` is mandatory.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        for key in map.keys() {
            match key.as_str() {
                "data_device" | "meta_device" | "journal_device" | "block_size"
                | "block_order" | "journal_len" | "data_offset" | "meta_offset"
                | "journal_offset" | "disk_alignment" | "journal_sector_buffer_count" => {}
                other => {
                    return Err(Error::config(format!("unknown option: {other}")));
                }
            }
        }

        let data_device = PathBuf::from(
            map.get("data_device")
                .ok_or_else(|| Error::config("data_device is required"))?,
        );
        let meta_device = map
            .get("meta_device")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_device.clone());
        let journal_device = map
            .get("journal_device")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_device.clone());

        let block_order = match (map.get("block_size"), map.get("block_order")) {
            (Some(_), Some(_)) => {
                return Err(Error::config("block_size and block_order are exclusive"));
            }
            (Some(raw), None) => {
                let size: u32 = parse_num(raw, "block_size")?;
                if !size.is_power_of_two() {
                    return Err(Error::config("block_size must be a power of two"));
                }
                size.trailing_zeros()
            }
            (None, Some(raw)) => parse_num(raw, "block_order")?,
            (None, None) => DEFAULT_BLOCK_ORDER,
        };

        let cfg = Self {
            data_device,
            meta_device,
            journal_device,
            block_order,
            block_size: 1u32
                .checked_shl(block_order)
                .ok_or_else(|| Error::config("block_order out of range"))?,
            data_offset: parse_opt(map, "data_offset", 0)?,
            meta_offset: parse_opt(map, "meta_offset", 0)?,
            journal_offset: parse_opt(map, "journal_offset", 0)?,
            journal_len: parse_opt(map, "journal_len", DEFAULT_JOURNAL_LEN)?,
            disk_alignment: parse_opt(map, "disk_alignment", u64::from(DEFAULT_DISK_ALIGNMENT))?
                as u32,
            journal_sector_buffer_count: parse_opt(
                map,
                "journal_sector_buffer_count",
                DEFAULT_SECTOR_BUFFER_COUNT as u64,
            )? as usize,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::config(format!(
                "block_size {} outside [{}, {}]",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if !self.disk_alignment.is_power_of_two() || self.disk_alignment < 512 {
            return Err(Error::config(
                "disk_alignment must be a power of two and at least 512",
            ));
        }
        if self.block_size % self.disk_alignment != 0 {
            return Err(Error::config(
                "block_size must be a multiple of disk_alignment",
            ));
        }
        if self.journal_len % 512 != 0 || self.journal_len < 4 * 512 {
            return Err(Error::config(
                "journal_len must be a multiple of 512 and at least 4 sectors",
            ));
        }
        if self.journal_sector_buffer_count < 2 {
            return Err(Error::config(
                "journal_sector_buffer_count must be at least 2",
            ));
        }
        for (name, off) in [
            ("data_offset", self.data_offset),
            ("meta_offset", self.meta_offset),
            ("journal_offset", self.journal_offset),
        ] {
            if off % 512 != 0 {
                return Err(Error::config(format!("{name} must be a multiple of 512")));
            }
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::config(format!("invalid value for {key}: {raw:?}")))
}

fn parse_opt(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match map.get(key) {
        Some(raw) => parse_num(raw, key),
        None => Ok(default),
    }
}
