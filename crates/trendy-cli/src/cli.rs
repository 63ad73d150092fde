use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "trendy")]
#[command(about = "Track events locally and sync them when the network allows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push queued changes and pull remote ones
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop the local cursor and rebuild from a full server snapshot
    Resync,
    /// Show sync state, queue depth and recommendations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or manage the pending mutation queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show recent sync cycles
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage local events
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Manage event types
    Types {
        #[command(subcommand)]
        command: TypeCommands,
    },
    /// Show or write configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
        /// Output file path (defaults to stdout)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued mutations in send order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every queued mutation
    Clear,
    /// Re-arm abandoned mutations for another round of attempts
    Retry,
}

#[derive(Subcommand)]
pub enum EventCommands {
    /// List recent events
    List {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a new event
    #[command(alias = "new")]
    Add {
        /// Event type name or ID
        #[arg(long = "type", value_name = "TYPE")]
        event_type: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Event time (RFC 3339, defaults to now)
        #[arg(long, value_name = "TIME")]
        at: Option<String>,
        /// End time (RFC 3339)
        #[arg(long, value_name = "TIME")]
        end: Option<String>,
        /// Mark the event as all-day
        #[arg(long)]
        all_day: bool,
    },
    /// Edit an existing event
    Edit {
        /// Event ID or unique ID prefix
        id: String,
        /// Replace the notes
        #[arg(long, conflicts_with = "clear_notes")]
        notes: Option<String>,
        /// Remove the notes
        #[arg(long)]
        clear_notes: bool,
        /// Move the event to a new time (RFC 3339)
        #[arg(long, value_name = "TIME")]
        at: Option<String>,
        /// Set the end time (RFC 3339)
        #[arg(long, value_name = "TIME", conflicts_with = "clear_end")]
        end: Option<String>,
        /// Remove the end time
        #[arg(long)]
        clear_end: bool,
    },
    /// Delete an existing event
    Delete {
        /// Event ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TypeCommands {
    /// List event types
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create an event type
    Add {
        /// Display name
        name: String,
        /// Hex color
        #[arg(long, default_value = "#4ECDC4")]
        color: String,
        /// Icon name
        #[arg(long, default_value = "circle")]
        icon: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration (token redacted)
    Show,
    /// Print the configuration file path
    Path,
    /// Write the configuration file with the given values
    Init {
        /// Backend base URL
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
        /// Local database path to persist in the file
        #[arg(long = "store-path", value_name = "PATH")]
        store_path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
