//! ObjectDB CLI Module
//! Command-line interface over a configured object store

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::store::Key;

#[derive(Parser, Debug)]
#[command(name = "objectdb")]
#[command(version)]
#[command(about = "Versioned object store with migrations", long_about = None)]
pub struct Cli {
    /// Project directory holding objectdb.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Connection key from the config (defaults to the config's default)
    #[arg(short, long, global = true)]
    pub connection: Option<String>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default objectdb.config.json
    Init {
        /// Database name
        #[arg(short, long)]
        name: String,
    },

    /// Open the database, run pending migrations and show its state
    Status,

    /// List the databases in the configured storage
    Databases,

    /// Migration commands
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Insert records from a JSON file (object or array); taken keys are skipped
    Insert {
        collection: String,
        file: PathBuf,
    },

    /// Insert or replace records from a JSON file (object or array)
    Update {
        collection: String,
        file: PathBuf,
    },

    /// Look up one record
    Find {
        collection: String,
        key: String,
        /// Look up through this index instead of the primary key
        #[arg(short, long)]
        index: Option<String>,
    },

    /// Look up several records; missing keys are left out
    WhereIn {
        collection: String,
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(short, long)]
        index: Option<String>,
    },

    /// Delete records by primary key
    Delete {
        collection: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Delete the whole database
    Drop,
}

#[derive(Subcommand, Debug)]
pub enum MigrateAction {
    /// Create an empty migration file for a version
    Create {
        /// Migration name
        name: String,

        /// Target version (defaults to the connection's version)
        #[arg(long)]
        version: Option<u32>,
    },

    /// List registered migrations per version
    List,
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

/// Integers become numeric keys, everything else a text key.
pub fn parse_key(raw: &str) -> Key {
    match raw.parse::<i64>() {
        Ok(n) => Key::Int(n),
        Err(_) => Key::Text(raw.to_string()),
    }
}
