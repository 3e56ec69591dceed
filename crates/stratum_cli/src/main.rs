//! Stratum CLI
//!
//! Maintenance tools for Stratum data directories and key stores.
//!
//! # Commands
//!
//! - `init` - Create the data directory and its key store
//! - `info` - Display timestamps and key store state
//! - `rotate-master-key` - Re-encrypt the key store under a new master key
//! - `drop-key` - Delete the data key of a database
//! - `hot-backup` - Copy a consistent image of the data directory
//! - `backup-manifest` - List the blocks of a non-blocking backup

mod commands;
mod error;

use clap::{Parser, Subcommand};
use commands::backup::ManifestOptions;
use commands::{Target, TargetOptions};
use std::path::PathBuf;
use stratum_core::backup::DEFAULT_BLOCK_SIZE_MB;
use tracing_subscriber::EnvFilter;

/// Stratum command-line maintenance tools.
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// JSON engine configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// File holding the base64 master key
    #[arg(global = true, long, conflicts_with = "secret_name")]
    key_file: Option<PathBuf>,

    /// Secret name of the master key
    #[arg(global = true, long)]
    secret_name: Option<String>,

    /// Directory holding secrets, one file per name
    #[arg(global = true, long)]
    secrets_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and its key store
    Init,

    /// Display timestamps and key store state
    Info {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Re-encrypt the key store under a new master key
    RotateMasterKey,

    /// Delete the data key of a database
    DropKey {
        /// Database whose key is deleted
        db: String,
    },

    /// Copy a consistent image of the data directory
    HotBackup {
        /// Destination directory
        dest: PathBuf,
    },

    /// List the blocks of a non-blocking backup
    BackupManifest {
        /// List changed ranges since a previous backup
        #[arg(short, long)]
        incremental: bool,

        /// Identifier of the previous backup
        #[arg(long, requires = "incremental")]
        src_id: Option<String>,

        /// Granularity of changed ranges in megabytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE_MB)]
        block_size_mb: u64,

        /// Blocks fetched per batch
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = TargetOptions {
        path: cli.path,
        config_file: cli.config,
        key_file: cli.key_file,
        secret_name: cli.secret_name,
        secrets_dir: cli.secrets_dir,
    };

    match cli.command {
        Commands::Init => {
            commands::init::run(&Target::resolve(&options, "init")?)?;
        }
        Commands::Info { format } => {
            commands::info::run(&Target::resolve(&options, "info")?, &format)?;
        }
        Commands::RotateMasterKey => {
            commands::rotate::run(&Target::resolve(&options, "rotate-master-key")?)?;
        }
        Commands::DropKey { db } => {
            commands::drop_key::run(&Target::resolve(&options, "drop-key")?, &db)?;
        }
        Commands::HotBackup { dest } => {
            commands::backup::hot(&Target::resolve(&options, "hot-backup")?, &dest)?;
        }
        Commands::BackupManifest {
            incremental,
            src_id,
            block_size_mb,
            batch_size,
            format,
        } => {
            let target = Target::resolve(&options, "backup-manifest")?;
            let manifest = ManifestOptions {
                incremental,
                src_id,
                block_size_mb,
                batch_size,
            };
            commands::backup::manifest(&target, &manifest, &format)?;
        }
        Commands::Version => {
            println!("Stratum CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
