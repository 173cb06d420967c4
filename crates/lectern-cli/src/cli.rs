use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lectern_core::models::{EntityType, Resolution, SermonStatus};

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Write sermons offline and sync them across devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a sermon or series
    #[command(alias = "new")]
    Add {
        #[command(subcommand)]
        kind: AddCommands,
    },
    /// List recent sermons and series
    List {
        /// Only list one kind of record
        #[arg(value_enum)]
        kind: Option<RecordKind>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a record with its sync state
    Show {
        /// Record ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a record in $EDITOR, or patch single fields with flags
    Edit {
        /// Record ID or unique ID prefix
        id: String,
        /// New title
        #[arg(long)]
        title: Option<String>,
        /// New sermon body (use "-" to read stdin)
        #[arg(long)]
        body: Option<String>,
        /// New series description
        #[arg(long)]
        description: Option<String>,
        /// Replace sermon tags
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
        /// New sermon status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        /// Move a sermon into a series (ID or prefix, "none" to detach)
        #[arg(long, value_name = "ID")]
        series: Option<String>,
    },
    /// Delete a record
    Delete {
        /// Record ID or unique ID prefix
        id: String,
        /// Also delete every record that belongs to it
        #[arg(long)]
        cascade: bool,
    },
    /// Sync local changes with the remote store
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum AddCommands {
    /// Create a sermon
    Sermon {
        /// Sermon title
        title: Vec<String>,
        /// Markdown body (piped stdin is used when omitted)
        #[arg(long)]
        body: Option<String>,
        /// Tag, repeatable
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
        /// Series the sermon belongs to (ID or prefix)
        #[arg(long, value_name = "ID")]
        series: Option<String>,
    },
    /// Create a series
    Series {
        /// Series title
        title: Vec<String>,
        /// Series description
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RecordKind {
    Sermon,
    Series,
}

impl From<RecordKind> for EntityType {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Sermon => Self::Sermon,
            RecordKind::Series => Self::Series,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusArg {
    Draft,
    Ready,
    Preached,
    Archived,
}

impl From<StatusArg> for SermonStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Draft => Self::Draft,
            StatusArg::Ready => Self::Ready,
            StatusArg::Preached => Self::Preached,
            StatusArg::Archived => Self::Archived,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    Local,
    Remote,
    Merged,
}

impl From<ResolutionArg> for Resolution {
    fn from(resolution: ResolutionArg) -> Self {
        match resolution {
            ResolutionArg::Local => Self::LocalWins,
            ResolutionArg::Remote => Self::RemoteWins,
            ResolutionArg::Merged => Self::Merged,
        }
    }
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Run a sync session (default)
    Run {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending work and the outcome of the last session
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List pending sync conflicts
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a pending conflict
    Resolve {
        /// Conflict ID or unique ID prefix
        id: String,
        /// Which side to keep
        #[arg(long = "use", value_enum)]
        resolution: ResolutionArg,
        /// JSON object with the merged fields (required for `--use merged`)
        #[arg(long, value_name = "PATH")]
        merged_file: Option<PathBuf>,
    },
    /// Retry operations that exhausted their retry budget
    Requeue {
        /// Only requeue operations for this record (ID or prefix)
        id: Option<String>,
    },
    /// Release a quarantined record and queue it for sync again
    Unblock {
        /// Record ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Create or update the config file
    Init {
        /// Remote sync API base URL
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
        /// Owner id stamped on new records
        #[arg(long, value_name = "ID")]
        owner_id: Option<String>,
        /// Conflict policy: last-write-wins or manual
        #[arg(long, value_name = "NAME")]
        policy: Option<String>,
        /// Default local database path
        #[arg(long = "database", value_name = "PATH")]
        database: Option<PathBuf>,
    },
    /// Print the effective configuration
    Show,
}
