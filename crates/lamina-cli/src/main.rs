//! # lamina CLI
//!
//! Diagnostic command-line tool for Lamina path map files.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use lamina_config::logging::{init_logging, LogLevel};
use lamina_config::Config;
use lamina_pathmap::{Pathmap, PATHKEY_LEN};
use lamina_store::DiskStore;

/// Lamina — union filesystem path map diagnostics
#[derive(Parser)]
#[command(name = "lamina")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory containing the path map file
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Treat paths as case-insensitive
    #[arg(long)]
    case_insensitive: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a transaction-level trace of a path map log
    Dump {
        /// Map file name (defaults to the configured name)
        #[arg(value_name = "FILE")]
        file: Option<String>,
    },

    /// Print the live cells of a path map
    Mem {
        #[arg(value_name = "FILE")]
        file: Option<String>,

        /// Known paths to label keys with in the output
        #[arg(short, long)]
        path: Vec<String>,
    },

    /// Summarize a path map file
    Stats {
        #[arg(value_name = "FILE")]
        file: Option<String>,
    },
}

fn open_map(
    store: &Arc<DiskStore>,
    file: Option<String>,
    cfg: &Config,
    case_insensitive: bool,
) -> Result<Pathmap> {
    let file = file.unwrap_or_else(|| cfg.map.file.clone());
    tracing::debug!("opening path map {file}");
    Ok(Pathmap::open(store.clone(), &file, case_insensitive)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = lamina_config::config().clone();
    init_logging(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::parse(&cfg.log.level)
    });

    let case_insensitive = cli.case_insensitive || cfg.map.case_insensitive;
    let store = Arc::new(DiskStore::new(&cli.root)?);
    let stdout = std::io::stdout();

    match cli.command {
        Commands::Dump { file } => {
            let pm = open_map(&store, file, &cfg, case_insensitive)?;
            pm.dump(&mut stdout.lock())?;
        }

        Commands::Mem { file, path } => {
            let pm = open_map(&store, file, &cfg, case_insensitive)?;
            for p in &path {
                pm.add_dump_path(p);
            }
            pm.dump_mem(&mut stdout.lock())?;
        }

        Commands::Stats { file } => {
            let pm = open_map(&store, file, &cfg, case_insensitive)?;
            let stats = pm.stats();
            let mut out = stdout.lock();
            writeln!(out, "cells:      {}", pm.len())?;
            writeln!(out, "log bytes:  {}", pm.log_len())?;
            writeln!(out, "records:    {}", pm.log_len() / PATHKEY_LEN as u64)?;
            writeln!(out, "whiteouts:  {}", stats.whiteouts)?;
            writeln!(out, "opaques:    {}", stats.opaques)?;
            writeln!(out, "indexed:    {}", stats.indexed)?;
            writeln!(out, "dirty:      {}", stats.dirty)?;
        }
    }

    Ok(())
}
