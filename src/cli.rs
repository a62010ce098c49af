use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "splitsearch",
    about = "Paginated full-text search over cached dataset split indexes"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search a split of a dataset
    Search(SearchArgs),
    /// Inspect and drive the index-build job queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Read and write the local response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Build index artifacts
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Clean the cached assets of a dataset now
    Clean(CleanArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Text to search for
    pub query: Option<String>,

    #[arg(long)]
    pub dataset: Option<String>,

    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub split: Option<String>,

    /// Index of the first matching row to return
    #[arg(long, allow_negative_numbers = true)]
    pub offset: Option<i64>,

    /// Number of rows to return
    #[arg(long, allow_negative_numbers = true)]
    pub length: Option<i64>,

    /// Take every parameter from a raw URL query string instead
    #[arg(
        long,
        conflicts_with_all = [
            "query", "dataset", "config", "split", "offset", "length"
        ]
    )]
    pub query_string: Option<String>,
}

// -- Queue subcommands --

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Create a waiting job for a dataset unless one is pending
    Enqueue {
        dataset: String,
    },
    /// Claim the oldest waiting job
    Dequeue,
    /// Mark a started job as finished
    Finish {
        job_id: String,
    },
    /// Count jobs by status
    Status {
        /// Only this status (waiting, started or finished)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job
    Show {
        job_id: String,
    },
    /// Delete every job
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

// -- Cache subcommands --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Store a response for a split
    Put(CachePutArgs),
    /// Show the best stored response for a split
    Get {
        #[command(flatten)]
        split: SplitArgs,

        /// Cache kinds to consider, in preference order
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
    /// Delete the stored response of one kind for a split
    Remove {
        #[command(flatten)]
        split: SplitArgs,

        #[arg(long, default_value = splitsearch::resolver::SPLIT_FTS_INDEX_KIND)]
        kind: String,
    },
}

#[derive(Debug, Parser)]
pub struct SplitArgs {
    #[arg(long)]
    pub dataset: String,

    #[arg(long)]
    pub config: String,

    #[arg(long)]
    pub split: String,
}

#[derive(Debug, Parser)]
pub struct CachePutArgs {
    #[command(flatten)]
    pub split: SplitArgs,

    /// Cache kind of the response
    #[arg(long, default_value = splitsearch::resolver::SPLIT_FTS_INDEX_KIND)]
    pub kind: String,

    /// Artifact filename of a successful index response
    #[arg(long, conflicts_with = "content")]
    pub filename: Option<String>,

    /// Raw JSON content of the response
    #[arg(long)]
    pub content: Option<String>,

    /// HTTP-like status of the response
    #[arg(long, default_value = "200")]
    pub http_status: u16,

    #[arg(long)]
    pub error_code: Option<String>,

    /// Pinned dataset revision
    #[arg(long)]
    pub revision: Option<String>,
}

// -- Index --

#[derive(Debug, Subcommand)]
pub enum IndexAction {
    /// Build an index archive from a JSON Lines file of rows
    Build {
        /// JSON Lines input, one object per row
        rows: PathBuf,

        /// Searchable column (repeatable)
        #[arg(short, long = "column", required = true)]
        columns: Vec<String>,

        /// Archive to write
        #[arg(short, long)]
        output: PathBuf,
    },
}

// -- Clean --

#[derive(Debug, Parser)]
pub struct CleanArgs {
    pub dataset: String,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "splitsearch",
            &mut std::io::stdout(),
        );
    }
}
