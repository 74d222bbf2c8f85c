use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "loam")]
#[command(about = "Local-first records that sync through a change log")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local replica database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Sync server base URL (overrides LOAM_SERVER_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub server_url: Option<String>,

    /// Tenant to sync with (overrides LOAM_TENANT)
    #[arg(long, global = true, value_name = "NAME")]
    pub tenant: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record from a JSON object
    #[command(alias = "new")]
    Create {
        table: String,
        id: String,
        /// JSON object, or `-` to read it from stdin
        doc: String,
    },
    /// Patch top-level fields of a record; `null` removes a field
    #[command(alias = "edit")]
    Update {
        table: String,
        id: String,
        /// JSON object, or `-` to read it from stdin
        patch: String,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete { table: String, id: String },
    /// Print one record as JSON
    Get { table: String, id: String },
    /// List live records of a table, most recently written first
    List {
        table: String,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show changes waiting to be pushed
    Outbox {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the replica's sync position
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List quarantined records, or release one as `table/id`
    Quarantine {
        #[arg(long, value_name = "TABLE/ID")]
        release: Option<String>,
    },
    /// Run one sync step against the server
    Sync,
    /// Keep the replica synced until interrupted
    Daemon,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

impl CompletionShell {
    /// Completion script for the `loam` binary
    pub fn script(self) -> Vec<u8> {
        let shell = match self {
            Self::Bash => Shell::Bash,
            Self::Zsh => Shell::Zsh,
            Self::Fish => Shell::Fish,
        };
        let mut script = Vec::new();
        clap_complete::generate(shell, &mut Cli::command(), "loam", &mut script);
        script
    }
}
