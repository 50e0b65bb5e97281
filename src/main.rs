//! framelog - durable, hash-chained, rotating file logs
//!
//! Writes records from stdin through the writer engine, and verifies, repairs
//! and dumps existing streams.

use clap::{Parser, Subcommand};
use colored::Colorize;
use framelog_codec::Utf8Codec;
use framelog_engine::{Config, WriterEngine};
use framelog_store::{
    repair_dir, verify_dir, FieldValue, FileScanner, FrameCodec, FrameReader, Level, LogRecord,
    RecoveryResult, Timestamp, VerifiedFrame,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "framelog")]
#[command(about = "Durable, hash-chained, rotating file logs")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "FRAMELOG_CONFIG")]
    config: Option<PathBuf>,

    /// Stream directory (overrides config)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append each line of stdin as a record
    Write {
        /// Record level
        #[arg(short, long, default_value = "info")]
        level: Level,

        /// Structured field added to every record (key=value)
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, FieldValue)>,
    },

    /// Verify every file of the stream
    Verify,

    /// Truncate invalid bytes after the last valid frame of each file
    Repair,

    /// Print records
    Dump {
        /// Only this rotation index
        #[arg(short, long)]
        index: Option<u64>,

        /// Print JSON lines instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load configuration (from file if given, then env overrides)
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.dir {
        config.stream.dir = dir;
    }
    config.validate()?;

    match cli.command {
        Commands::Write { level, fields } => write(&config, level, fields).await,
        Commands::Verify => {
            let result = verify_dir(&config.stream.dir, config.stream.naming()?, codec(&config))?;
            print_recovery("Verified", &result);
            if !result.is_clean() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Repair => {
            let result = repair_dir(&config.stream.dir, config.stream.naming()?, codec(&config))?;
            print_recovery("Repaired", &result);
            Ok(())
        }
        Commands::Dump { index, json } => dump(&config, index, json),
        Commands::Config { output } => {
            match output {
                Some(path) => {
                    config.save(&path)?;
                    eprintln!("{} {}", "Saved".green(), path.display());
                }
                None => print!("{}", serde_yaml::to_string(&config)?),
            }
            Ok(())
        }
    }
}

async fn write(
    config: &Config,
    level: Level,
    fields: Vec<(String, FieldValue)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = WriterEngine::open(config.engine_config()?).await?;
    let window = config.writer.queue_capacity;

    let mut sequence = engine.last_sequence().map_or(1, |s| s + 1);
    let mut timestamp = Timestamp::from_nanos(0);
    let mut pending = VecDeque::with_capacity(window);
    let mut written = 0u64;
    let mut failed = 0u64;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        timestamp = Timestamp::now_after(timestamp);
        let mut record = LogRecord::new(sequence, timestamp, level, line);
        for (key, value) in &fields {
            record = record.with_field(key.clone(), value.clone());
        }
        sequence += 1;

        pending.push_back(engine.submit(record).await?);
        if pending.len() >= window {
            if let Some(oldest) = pending.pop_front() {
                match oldest.await {
                    Ok(_) => written += 1,
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", "Error".red(), e);
                    }
                }
            }
        }
    }

    for p in pending {
        match p.await {
            Ok(_) => written += 1,
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", "Error".red(), e);
            }
        }
    }
    engine.shutdown().await;

    let stats = engine.stats();
    eprintln!(
        "{} {} records ({} bytes, {} rotations) to {}",
        "Wrote".green(),
        written,
        stats.bytes_written,
        stats.rotations,
        config.stream.dir.display()
    );
    if failed > 0 {
        eprintln!("{}: {} records failed", "Warning".yellow(), failed);
        std::process::exit(1);
    }
    Ok(())
}

fn dump(config: &Config, index: Option<u64>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let naming = config.stream.naming()?;
    let codec = codec(config);
    let indices = match index {
        Some(i) => vec![i],
        None => FileScanner::list(&config.stream.dir, &naming)?,
    };

    for index in indices {
        let path = naming.path(&config.stream.dir, index);
        for frame in FrameReader::open(&path, &codec)? {
            match frame {
                Ok(frame) if json => println!("{}", frame_json(index, &frame)),
                Ok(frame) => println!("{}", frame.record),
                Err(e) => {
                    eprintln!("{} {}: {}", "Corrupt".red(), path.display(), e);
                    break;
                }
            }
        }
    }
    Ok(())
}

fn frame_json(index: u64, frame: &VerifiedFrame) -> serde_json::Value {
    let record = &frame.record;
    serde_json::json!({
        "file": index,
        "offset": frame.offset,
        "sequence": record.sequence(),
        "timestamp": record.timestamp().to_string(),
        "level": record.level(),
        "message": record.message(),
        "fields": record.fields(),
        "digest": frame.link.digest.to_string(),
    })
}

fn print_recovery(action: &str, result: &RecoveryResult) {
    let status = if result.is_clean() {
        action.green()
    } else {
        action.yellow()
    };
    println!(
        "{} {} files, {} records (max sequence {})",
        status,
        result.files_scanned,
        result.valid_records,
        result
            .max_sequence
            .map_or_else(|| "-".to_string(), |s| s.to_string())
    );
    for (index, problem) in &result.files_recovered {
        println!("  {} file {:016x}: {}", "Invalid".red(), index, problem);
    }
    for (index, error) in &result.files_with_errors {
        println!("  {} file {:016x}: {}", "Unreadable".red(), index, error);
    }
    if result.bytes_truncated > 0 {
        println!("  {} invalid bytes", result.bytes_truncated);
    }
}

fn codec(config: &Config) -> FrameCodec {
    FrameCodec::new(config.stream.digest.adapter(), Arc::new(Utf8Codec))
}

/// Parses `key=value`; the value becomes a bool, integer or float when it
/// parses as one, a string otherwise.
fn parse_field(s: &str) -> Result<(String, FieldValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err("field key cannot be empty".to_string());
    }

    let value = if let Ok(b) = value.parse::<bool>() {
        FieldValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        FieldValue::Int(i)
    } else if let Some(f) = value.parse::<f64>().ok().filter(|f| f.is_finite()) {
        FieldValue::Float(f)
    } else {
        FieldValue::Str(value.to_string())
    };
    Ok((key.to_string(), value))
}
