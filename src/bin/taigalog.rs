// taigalog: dump the records of a TaigaDB write-ahead log.
//
// Walks the log first to last and prints one line per record through
// the dispatch table's print handlers.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use taigadb::transaction::recovery::dispatch;
use taigadb::transaction::wal::log_record::decode;
use taigadb::transaction::wal::log_store::LogStoreError;
use taigadb::transaction::wal::{LogCursor, LogStore, LogStoreConfig, SeekPos};
use taigadb::Lsn;

#[derive(Parser)]
#[command(name = "taigalog", about = "Dump TaigaDB log records")]
struct Args {
    /// Log directory
    log_dir: PathBuf,

    /// Segment file base name
    #[arg(long, default_value = "taigadb")]
    base_name: String,

    /// Start from this LSN, as file:offset
    #[arg(long, value_parser = parse_lsn)]
    start: Option<Lsn>,

    /// Walk the log newest-first
    #[arg(short, long)]
    reverse: bool,
}

fn parse_lsn(s: &str) -> Result<Lsn, String> {
    let (file, offset) = s
        .split_once(':')
        .ok_or_else(|| "expected file:offset".to_string())?;
    let file = file.parse().map_err(|e| format!("bad file index: {e}"))?;
    let offset = offset.parse().map_err(|e| format!("bad offset: {e}"))?;
    Ok(Lsn::new(file, offset))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = LogStoreConfig {
        log_dir: args.log_dir.clone(),
        base_name: args.base_name.clone(),
        force_sync: false,
        ..Default::default()
    };
    let store = LogStore::open(config)
        .with_context(|| format!("opening log in {}", args.log_dir.display()))?;

    let table = dispatch::table();
    let mut cursor = LogCursor::new(&store);
    let first = match args.start {
        Some(lsn) => SeekPos::Set(lsn),
        None if args.reverse => SeekPos::Last,
        None => SeekPos::First,
    };
    let step = if args.reverse { SeekPos::Prev } else { SeekPos::Next };

    let mut seek = first;
    let mut printed = 0usize;
    loop {
        match cursor.get(seek) {
            Ok((lsn, payload)) => {
                let record = decode(&payload).with_context(|| format!("decoding record at {lsn}"))?;
                println!("{}", table.print(lsn, &record).map_err(|e| anyhow::anyhow!("{e}"))?);
                printed += 1;
            }
            Err(LogStoreError::NotFound) => {
                if printed == 0 {
                    println!("no log records");
                }
                break;
            }
            Err(e) => bail!("log read failed: {e}"),
        }
        seek = step;
    }

    Ok(())
}
