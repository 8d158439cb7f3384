//! hipo - inspect and rewrite evio / HIPO files
//!
//! ```bash
//! # Summary of a file
//! hipo info run.hipo
//! hipo info run.hipo --json
//!
//! # Hex dump of one event (0-based)
//! hipo dump run.hipo --event 12
//!
//! # Rewrite with another codec, compressing on 4 threads
//! hipo recompress run.evio run.hipo --compression lz4 --threads 4
//! hipo recompress run.evio run.hipo --options writer.json
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hipo_evio::{
    ByteOrder, CompressionType, EvioError, Reader, RecordPosition, Result, WriterMT, WriterOptions,
};

#[derive(Parser)]
#[command(name = "hipo")]
#[command(about = "Inspect and rewrite evio / HIPO record files")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print file header, record and event counts
    Info {
        input: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,

        /// Walk every record header instead of trusting the index
        #[arg(long)]
        force_scan: bool,
    },

    /// Hex dump one event
    Dump {
        input: PathBuf,

        /// Event number, counting from 0
        #[arg(short, long)]
        event: usize,
    },

    /// Copy every event into a new file with different settings
    Recompress {
        input: PathBuf,
        output: PathBuf,

        /// none, lz4, lz4-best or gzip
        #[arg(short, long)]
        compression: Option<CompressionType>,

        /// Compression threads
        #[arg(short, long)]
        threads: Option<usize>,

        /// Maximum events per record
        #[arg(long)]
        max_events: Option<u32>,

        /// JSON file of writer options; flags given here override it
        #[arg(long)]
        options: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct FileInfo {
    path: PathBuf,
    version: u32,
    byte_order: ByteOrder,
    compression: CompressionType,
    records: usize,
    events: usize,
    dictionary: Option<String>,
    has_first_event: bool,
    record_positions: Vec<RecordPosition>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Info {
            input,
            json,
            force_scan,
        } => cmd_info(input, json, force_scan),
        Commands::Dump { input, event } => cmd_dump(input, event),
        Commands::Recompress {
            input,
            output,
            compression,
            threads,
            max_events,
            options,
        } => {
            let base = match options {
                Some(path) => load_options(&path)?,
                None => WriterOptions::default(),
            };
            cmd_recompress(input, output, base, compression, threads, max_events)
        }
    }
}

fn cmd_info(input: PathBuf, json: bool, force_scan: bool) -> Result<()> {
    let opts = hipo_evio::ReaderOptions {
        force_scan,
        ..Default::default()
    };
    let mut reader = Reader::open_with(&input, opts)?;
    let info = FileInfo {
        version: reader.version(),
        byte_order: reader.byte_order(),
        compression: reader
            .first_record_header()
            .map_or(CompressionType::None, |h| h.compression),
        records: reader.record_count(),
        events: reader.event_count(),
        dictionary: reader.dictionary()?,
        has_first_event: reader.has_first_event(),
        record_positions: reader.record_positions().to_vec(),
        path: input,
    };

    if json {
        let text = serde_json::to_string_pretty(&info)
            .map_err(|e| EvioError::Format(format!("cannot encode summary: {e}")))?;
        println!("{text}");
        return Ok(());
    }

    println!("file:         {}", info.path.display());
    println!("version:      {}", info.version);
    println!("byte order:   {:?}", info.byte_order);
    println!("compression:  {}", info.compression);
    println!("records:      {}", info.records);
    println!("events:       {}", info.events);
    println!("first event:  {}", info.has_first_event);
    match &info.dictionary {
        Some(xml) => println!("dictionary:   {} bytes\n{xml}", xml.len()),
        None => println!("dictionary:   none"),
    }
    for (i, p) in info.record_positions.iter().enumerate() {
        println!("  record {i:>5}  at {:>12}  {:>10} bytes  {:>7} events", p.position, p.length, p.count);
    }
    Ok(())
}

fn cmd_dump(input: PathBuf, event: usize) -> Result<()> {
    let mut reader = Reader::open(&input)?;
    let bytes = reader
        .get_event(event)?
        .ok_or_else(|| EvioError::NotFound(format!("event {event} of {}", reader.event_count())))?;
    let order = reader.byte_order();

    println!("event {event}: {} bytes, {:?} endian", bytes.len(), order);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let words: Vec<String> = chunk
            .chunks(4)
            .map(|w| {
                if w.len() == 4 {
                    format!("{:08x}", order.read_u32(w))
                } else {
                    w.iter().map(|b| format!("{b:02x}")).collect()
                }
            })
            .collect();
        println!("{:08x}  {}", row * 16, words.join(" "));
    }
    Ok(())
}

fn load_options(path: &Path) -> Result<WriterOptions> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| EvioError::Format(format!("{}: {e}", path.display())))
}

fn cmd_recompress(
    input: PathBuf,
    output: PathBuf,
    base: WriterOptions,
    compression: Option<CompressionType>,
    threads: Option<usize>,
    max_events: Option<u32>,
) -> Result<()> {
    let start = Instant::now();
    let mut reader = Reader::open(&input)?;

    let mut opts = base.with_byte_order(reader.byte_order());
    if let Some(c) = compression {
        opts = opts.with_compression(c);
    }
    if let Some(n) = threads {
        opts = opts.with_threads(n.max(1));
    }
    if let Some(n) = max_events {
        opts = opts.with_max_event_count(n);
    }
    if let Some(xml) = reader.dictionary()? {
        opts = opts.with_dictionary(xml);
    }
    if let Some(first) = reader.first_event()? {
        opts = opts.with_first_event(first);
    }

    let codec = opts.compression;
    let mut writer = WriterMT::create(&output, opts)?;
    let mut copied = 0u64;
    while let Some(event) = reader.get_next_event()? {
        writer.add_event(&event)?;
        copied += 1;
    }
    writer.close()?;
    reader.close();

    info!(
        events = copied,
        input = %input.display(),
        output = %output.display(),
        compression = %codec,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "recompressed"
    );
    Ok(())
}
