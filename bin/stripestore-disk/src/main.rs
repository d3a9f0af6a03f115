//! StripeStore disk tool
//!
//! Operator commands against local blockstore devices:
//! - `format`: write a fresh journal header and zero the metadata table
//! - `inspect`: print the journal header and a census of the store
//! - `dump-journal`: walk the journal chain and print every entry

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stripestore_common::StoreConfig;
use stripestore_engine::layout::{
    parse_entry, EntryParse, JournalHeader, JournalRecord, ENTRY_HEADER_SIZE, SECTOR_SIZE,
};
use stripestore_engine::ring::{Device, FileBackend, IoCmd, IoOutcome, RingBackend};
use stripestore_engine::{Blockstore, RawFile};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stripestore-disk")]
#[command(about = "Format and inspect StripeStore blockstore devices")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data device or file
    #[arg(long, global = true)]
    data_device: Option<PathBuf>,

    /// Metadata device (defaults to the data device)
    #[arg(long, global = true)]
    meta_device: Option<PathBuf>,

    /// Journal device (defaults to the data device)
    #[arg(long, global = true)]
    journal_device: Option<PathBuf>,

    /// Object block size in bytes
    #[arg(long, global = true)]
    block_size: Option<u64>,

    /// Journal region length in bytes
    #[arg(long, global = true)]
    journal_len: Option<u64>,

    /// Data region offset
    #[arg(long, global = true)]
    data_offset: Option<u64>,

    /// Metadata region offset
    #[arg(long, global = true)]
    meta_offset: Option<u64>,

    /// Journal region offset
    #[arg(long, global = true)]
    journal_offset: Option<u64>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the journal header and zero the metadata table
    Format {
        /// Create missing regular files of this size first
        #[arg(long)]
        create_size: Option<u64>,
    },
    /// Print the journal header and a census of recovered state
    Inspect,
    /// Walk the journal chain and print every entry
    DumpJournal,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    let cfg = build_config(&args)?;
    match args.command {
        Command::Format { create_size } => format(&cfg, create_size),
        Command::Inspect => inspect(cfg),
        Command::DumpJournal => dump_journal(&cfg),
    }
}

fn build_config(args: &Args) -> Result<StoreConfig> {
    let mut map = HashMap::new();
    let data = args
        .data_device
        .as_ref()
        .context("--data-device is required")?;
    map.insert("data_device".to_string(), data.display().to_string());
    if let Some(p) = &args.meta_device {
        map.insert("meta_device".to_string(), p.display().to_string());
    }
    if let Some(p) = &args.journal_device {
        map.insert("journal_device".to_string(), p.display().to_string());
    }
    for (key, value) in [
        ("block_size", args.block_size),
        ("journal_len", args.journal_len),
        ("data_offset", args.data_offset),
        ("meta_offset", args.meta_offset),
        ("journal_offset", args.journal_offset),
    ] {
        if let Some(v) = value {
            map.insert(key.to_string(), v.to_string());
        }
    }
    StoreConfig::from_map(&map).context("invalid configuration")
}

fn ensure_file(path: &Path, size: u64) -> Result<()> {
    if !path.exists() {
        RawFile::create(path, size)
            .with_context(|| format!("creating {}", path.display()))?;
        info!(path = %path.display(), size, "created device file");
    }
    Ok(())
}

fn open_backend(cfg: &StoreConfig) -> Result<FileBackend> {
    FileBackend::open(&cfg.data_device, &cfg.meta_device, &cfg.journal_device)
        .context("opening devices")
}

fn format(cfg: &StoreConfig, create_size: Option<u64>) -> Result<()> {
    if let Some(size) = create_size {
        ensure_file(&cfg.data_device, size)?;
        if cfg.meta_device != cfg.data_device {
            ensure_file(&cfg.meta_device, size)?;
        }
        if cfg.journal_device != cfg.data_device && cfg.journal_device != cfg.meta_device {
            ensure_file(&cfg.journal_device, cfg.journal_offset + cfg.journal_len)?;
        }
    }
    let mut backend = open_backend(cfg)?;
    Blockstore::format(cfg, &mut backend).context("formatting store")?;
    println!("formatted: block_size={} journal_len={}", cfg.block_size, cfg.journal_len);
    Ok(())
}

fn inspect(cfg: StoreConfig) -> Result<()> {
    let store = Blockstore::open(cfg).context("opening store")?;
    let journal = store.journal();
    println!("block_size:      {}", store.block_size());
    println!("block_count:     {}", store.block_count());
    println!("blocks_free:     {}", store.free_block_count());
    println!("journal_len:     {}", journal.len());
    println!("journal_used:    {}", journal.used_bytes());
    println!("journal_start:   {}", journal.used_start);
    println!("journal_next:    {}", journal.next_free);
    let objects = store.list_objects();
    let stable = objects.iter().filter(|(_, s)| *s).count();
    println!("object_versions: {} ({} stable)", objects.len(), stable);
    for (inode, bytes) in store.inode_space_stats() {
        println!("inode {inode:#x}: {bytes} bytes");
    }
    Ok(())
}

/// Raw journal walk, printing each chained entry without applying it.
fn dump_journal(cfg: &StoreConfig) -> Result<()> {
    let mut backend = open_backend(cfg)?;

    let head = read_sector(&mut backend, cfg.journal_offset)?;
    let header = JournalHeader::from_sector(&head)
        .map_err(|e| anyhow::anyhow!("journal header: {e}"))?;
    println!(
        "header: start_offset={} start_crc32={:#010x}",
        header.start_offset, header.start_crc32
    );

    let len = cfg.journal_len;
    let mut chain = header.start_crc32;
    let mut pos = header.start_offset;
    if pos < SECTOR_SIZE as u64 || pos >= len {
        bail!("journal start offset {pos} out of bounds");
    }

    loop {
        if len - pos < SECTOR_SIZE as u64 {
            pos = SECTOR_SIZE as u64;
        }
        let sector = read_sector(&mut backend, cfg.journal_offset + pos)?;
        let mut in_pos = 0usize;
        let mut next_free = pos + SECTOR_SIZE as u64;
        let mut accepted = 0usize;

        while in_pos + ENTRY_HEADER_SIZE <= SECTOR_SIZE {
            match parse_entry(&sector[in_pos..]) {
                Ok(EntryParse::None) => break,
                Err(e) => {
                    println!("{pos}+{in_pos}: unreadable entry ({e}), stopping");
                    return Ok(());
                }
                Ok(EntryParse::Entry(pe)) => {
                    if pe.crc32_prev != chain {
                        println!("{pos}+{in_pos}: chain break, stopping");
                        return Ok(());
                    }
                    chain = pe.crc32;
                    let payload = pe.record.payload_len() as u64;
                    let mut loc = String::new();
                    if payload > 0 {
                        if len - next_free < payload {
                            next_free = SECTOR_SIZE as u64;
                        }
                        loc = format!(" payload@{next_free}");
                        next_free += payload;
                    }
                    println!("{pos}+{in_pos}: {}{loc}", describe(&pe.record));
                    in_pos += pe.size;
                    accepted += 1;
                }
            }
        }
        if accepted == 0 {
            break;
        }
        pos = next_free;
        if len - pos < SECTOR_SIZE as u64 {
            pos = SECTOR_SIZE as u64;
        }
        if pos == header.start_offset {
            break;
        }
    }
    Ok(())
}

fn read_sector(backend: &mut FileBackend, offset: u64) -> Result<Vec<u8>> {
    match backend.run(IoCmd::Read {
        dev: Device::Journal,
        offset,
        len: SECTOR_SIZE as u32,
    })? {
        IoOutcome::Read(data) => Ok(data.to_vec()),
        IoOutcome::Done => unreachable!("read returns data"),
    }
}

fn describe(rec: &JournalRecord) -> String {
    match rec {
        JournalRecord::SmallWrite {
            oid,
            version,
            offset,
            len,
        } => format!("SMALL_WRITE {oid} v{version} [{offset}+{len}]"),
        JournalRecord::BigWrite {
            oid,
            version,
            location,
        } => format!("BIG_WRITE {oid} v{version} loc={location}"),
        JournalRecord::Delete { oid, version } => format!("DELETE {oid} v{version}"),
        JournalRecord::Sync => "SYNC".to_string(),
        JournalRecord::Stable { versions } => format!("STABLE x{}", versions.len()),
        JournalRecord::Rollback { versions } => format!("ROLLBACK x{}", versions.len()),
    }
}
