//! mapgen-io CLI tool
//!
//! Debugging front end over id streams: generate, sort, filter and inspect
//! the files the map generator passes between its stages.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mapgen_io::{
    count_records, filter_with, set_wire_format, sort_with, IdRecord, Record, RecordIterator,
    RecordWriter, StreamConfig, StreamOptions, WireFormat,
};

#[derive(Parser)]
#[command(name = "mapgen-io")]
#[command(about = "Inspect and manipulate mapgen record streams")]
struct Cli {
    /// Read and write the line-oriented text format instead of binary
    #[arg(long, global = true, env = "MAPGEN_TEXT_FORMAT")]
    text: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write random ids, duplicates included
    Gen {
        output: PathBuf,
        /// Number of ids to write
        #[arg(long, default_value_t = 1_000_000)]
        count: u64,
        /// Ids are drawn from 0..max-id (default: 2 * count)
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        max_id: Option<i64>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Sort an id stream in place, removing duplicates
    Sort {
        file: PathBuf,
        /// Directory for runs (default: next to the file)
        #[arg(long, env = "MAPGEN_TEMP_DIR")]
        temp_dir: Option<PathBuf>,
        #[arg(long, env = "MAPGEN_RUN_SIZE")]
        run_size: Option<usize>,
    },
    /// Keep (or with --blacklist drop) the ids listed in another sorted id stream
    Filter {
        source: PathBuf,
        dest: PathBuf,
        ids: PathBuf,
        #[arg(long)]
        blacklist: bool,
    },
    /// Print a stream as JSON lines
    Cat {
        file: PathBuf,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count the records of a stream
    Count { file: PathBuf },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();

    if cli.text {
        set_wire_format(WireFormat::Text);
    }
    StreamConfig::apply_env_record_limit();
    let config = StreamConfig::from_env();
    let start = Instant::now();

    match cli.command {
        Commands::Gen {
            output,
            count,
            max_id,
            seed,
        } => {
            let max_id = max_id.unwrap_or_else(|| {
                i64::try_from(count.max(1).saturating_mul(2)).unwrap_or(i64::MAX)
            });
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let options = StreamOptions::from_config(&config);
            let mut writer = RecordWriter::create_with(&output, &options)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            for _ in 0..count {
                writer.write(&IdRecord::new(rng.gen_range(0..max_id)))?;
            }
            let written = writer.close()?;
            info!("wrote {} ids below {} to {}", written, max_id, output.display());
        }
        Commands::Sort {
            file,
            temp_dir,
            run_size,
        } => {
            let temp_dir = temp_dir.unwrap_or_else(|| parent_dir(&file));
            let config = match run_size {
                Some(run_size) => config.with_run_size(run_size),
                None => config,
            };
            let stats = sort_with(
                &file,
                &temp_dir,
                IdRecord::blank,
                |a: &IdRecord, b: &IdRecord| a.cmp(b),
                &config,
            )
            .with_context(|| format!("Failed to sort {}", file.display()))?;
            println!("records read:    {}", stats.records_read);
            println!("records written: {}", stats.records_written);
            println!("runs:            {}", stats.runs);
            println!("merges:          {}", stats.merge_passes.len());
        }
        Commands::Filter {
            source,
            dest,
            ids,
            blacklist,
        } => {
            let stats = filter_with(
                &source,
                &dest,
                &ids,
                IdRecord::blank,
                |record: &IdRecord| record.id,
                !blacklist,
                &config,
            )
            .with_context(|| format!("Failed to filter {}", source.display()))?;
            println!("kept {} of {}", stats.kept, stats.read);
        }
        Commands::Cat { file, limit } => {
            let options = StreamOptions::from_config(&config);
            let records = RecordIterator::open_with(&file, IdRecord::blank, &options)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            for record in records.take(limit.unwrap_or(usize::MAX)) {
                println!("{}", record?.to_json()?);
            }
        }
        Commands::Count { file } => {
            let options = StreamOptions::from_config(&config);
            let count = count_records(&file, IdRecord::blank, &options)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}", count);
        }
    }

    info!("done in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn parent_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_rejects_empty_id_range() {
        for bad in ["0", "-5"] {
            let parsed = Cli::try_parse_from(["mapgen-io", "gen", "ids.dat", "--max-id", bad]);
            assert!(parsed.is_err(), "--max-id {} was accepted", bad);
        }
        let cli = Cli::try_parse_from(["mapgen-io", "gen", "ids.dat", "--max-id", "1"]).unwrap();
        match cli.command {
            Commands::Gen { max_id, .. } => assert_eq!(max_id, Some(1)),
            _ => panic!("expected gen"),
        }
    }
}
