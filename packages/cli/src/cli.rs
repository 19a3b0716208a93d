//! Command line definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// jobq - priority job queue and worker pool
#[derive(Debug, Parser)]
#[command(name = "jobq", version, about = "Priority job queue and worker pool")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging and per-job output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process jobs in this process until the queue is empty or a limit is hit
    Run(RunArgs),

    /// Print queue statistics
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List dead-letter jobs
    Dlq {
        /// Maximum number of jobs to list
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Run the worker pool in the foreground until Ctrl-C or a stop request
    Start(PoolArgs),

    /// Ask the running worker pool to drain and wait for it
    Stop,

    /// Stop the running worker pool, then start a new one here
    Restart(PoolArgs),

    /// Print the worker pool, its workers and job counts
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Add a job to the queue
    Enqueue(EnqueueArgs),

    /// Serve the monitoring API only
    Serve {
        /// Listen address, overrides `http.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Only claim jobs from this band (name or number)
    #[arg(short, long, conflicts_with = "retry")]
    pub priority: Option<String>,

    /// Only claim jobs waiting for a retry
    #[arg(short, long)]
    pub retry: bool,

    /// Stop after settling this many jobs
    #[arg(short, long)]
    pub limit: Option<u64>,

    /// Keep polling for this many seconds instead of stopping when idle
    #[arg(short, long, value_name = "SECS")]
    pub budget: Option<u64>,
}

#[derive(Debug, Args)]
pub struct PoolArgs {
    /// Number of workers, overrides `supervisor.pool_size`
    #[arg(short, long)]
    pub workers: Option<u32>,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Processor key that consumes the payload
    #[arg(long)]
    pub processor: String,

    /// Priority band (name or number)
    #[arg(short, long)]
    pub priority: Option<String>,

    /// Attempts before the job is dead-lettered
    #[arg(short, long)]
    pub max_attempts: Option<u32>,

    /// JSON payload
    #[arg(long, default_value = "{}")]
    pub payload: String,
}
