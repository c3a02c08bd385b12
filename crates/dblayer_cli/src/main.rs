//! dblayer CLI
//!
//! Offline maintenance tools for dblayer environments.
//!
//! # Commands
//!
//! - `db2bak` (alias `db2archive`) - Archive the database with the server
//!   stopped
//! - `bak2db` - Restore an archive, or one instance of it
//! - `recover` - Recover after a crash and close cleanly
//! - `config` - Show tunables as the layer would apply them

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::Settings;

/// dblayer command-line database tools.
#[derive(Parser)]
#[command(name = "dblayer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database directory (nsslapd-directory)
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// JSON file of tunable names and values
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive the database into a directory
    #[command(alias = "db2archive")]
    Db2bak {
        /// Archive directory; an existing one is kept as <dir>.bak
        dest: PathBuf,
    },

    /// Restore the database from an archive directory
    Bak2db {
        /// Archive directory
        src: PathBuf,

        /// Restore only this instance
        #[arg(short = 'n', long)]
        instance: Option<String>,
    },

    /// Run recovery if the last shutdown was not clean
    Recover,

    /// Show tunables
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective value of one tunable, or of all of them
    Get {
        /// Tunable name, e.g. nsslapd-dbcachesize
        name: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the built-in defaults
    Defaults {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
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

    let settings = Settings {
        dir: cli.dir,
        config: cli.config,
    };

    match cli.command {
        Commands::Db2bak { dest } => commands::archive::db2bak(&settings, &dest)?,
        Commands::Bak2db { src, instance } => {
            commands::archive::bak2db(&settings, &src, instance.as_deref())?;
        }
        Commands::Recover => commands::recover::run(&settings)?,
        Commands::Config { action } => match action {
            ConfigAction::Get { name, format } => {
                commands::config::show(&settings, name.as_deref(), &format)?;
            }
            ConfigAction::Defaults { format } => commands::config::defaults(&format)?,
        },
        Commands::Version => {
            println!("dblayer CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
