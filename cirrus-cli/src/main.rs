// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus CLI
//!
//! Command-line client for the remote storage API.

mod commands;
mod config;

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(author, version, about = "Cirrus - remote storage client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output, repeat for more detail
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List folder contents
    #[command(alias = "dir")]
    Ls {
        /// Folder id (defaults to the root folder)
        #[arg(default_value_t = 0)]
        folder: u64,

        /// Long format with details
        #[arg(short, long)]
        long: bool,

        /// Human-readable sizes
        #[arg(short = 'H', long)]
        human: bool,

        /// Include subfolders recursively
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Create a folder
    Mkdir {
        /// Parent folder id
        parent: u64,

        /// Name of the new folder
        name: String,
    },

    /// Remove a file or folder (d123 / f456)
    Rm {
        /// Entry id(s) to remove
        #[arg(required = true)]
        entries: Vec<String>,

        /// Remove non-empty folders with everything inside
        #[arg(short, long)]
        recursive: bool,
    },

    /// Move an entry into another folder
    Mv {
        /// Entry id (d123 / f456)
        entry: String,

        /// Destination folder id
        to: u64,
    },

    /// Copy an entry into another folder
    Cp {
        /// Entry id (d123 / f456)
        entry: String,

        /// Destination folder id
        to: u64,

        /// Overwrite existing entries with the same name
        #[arg(short, long)]
        force: bool,
    },

    /// Rename an entry
    Rename {
        /// Entry id (d123 / f456)
        entry: String,

        /// New name
        name: String,
    },

    /// Upload a local file
    Put {
        /// Local file
        local: PathBuf,

        /// Destination folder id
        #[arg(default_value_t = 0)]
        folder: u64,

        /// Remote name (defaults to the local file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Download a file
    Get {
        /// File id
        file: u64,

        /// Local destination
        local: PathBuf,
    },

    /// Print a download link for a file
    Link {
        /// File id
        file: u64,

        /// Ask the content host to force a download
        #[arg(short, long)]
        download: bool,
    },

    /// Show account information
    Whoami,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let service = match config::Config::load(cli.config.as_deref()).and_then(|c| c.service()) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Ls { folder, long, human, recursive } => {
            commands::ls(&service, folder, long, human, recursive).await
        }
        Commands::Mkdir { parent, name } => commands::mkdir(&service, parent, &name).await,
        Commands::Rm { entries, recursive } => commands::rm(&service, &entries, recursive).await,
        Commands::Mv { entry, to } => commands::mv(&service, &entry, to).await,
        Commands::Cp { entry, to, force } => commands::cp(&service, &entry, to, force).await,
        Commands::Rename { entry, name } => commands::rename(&service, &entry, &name).await,
        Commands::Put { local, folder, name } => {
            commands::put(&service, &local, folder, name.as_deref()).await
        }
        Commands::Get { file, local } => commands::get(&service, file, &local).await,
        Commands::Link { file, download } => commands::link(&service, file, download).await,
        Commands::Whoami => commands::whoami(&service).await,
    };
    service.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
