//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dependency-aware batch test orchestrator
#[derive(Parser, Debug)]
#[command(name = "batchtest")]
#[command(version)]
#[command(about = "Run parameterized test suites under a shared resource pool")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file (defaults to the first of the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a test suite
    Run(RunArgs),

    /// Print the batches a strategy would produce, without running anything
    Partition(PartitionArgs),

    /// Inspect or create a pool snapshot
    Pool(PoolArgs),

    /// Host the resource pool for other sessions
    Broker(BrokerArgs),

    /// Print persisted case records from a work directory
    Status(StatusArgs),
}

/// Batching knobs shared by `run` and `partition`
#[derive(clap::Args, Debug, Default, Clone)]
pub struct BatchArgs {
    /// Split ready cases into this many batches
    #[arg(long, conflicts_with_all = ["batch_duration", "batch_pack"])]
    pub batch_count: Option<usize>,

    /// Group cases into batches of at most this many seconds
    #[arg(long, conflicts_with = "batch_pack")]
    pub batch_duration: Option<f64>,

    /// Pack cases into bins of WIDTH slots by HEIGHT seconds
    #[arg(long, value_name = "W:H")]
    pub batch_pack: Option<String>,

    /// Run composite cases in a trailing batch of their own
    #[arg(long)]
    pub exempt_composite: bool,

    /// Node affinity for duration batches (any, same, match)
    #[arg(long)]
    pub affinity: Option<String>,

    /// Node-count matching for `match` affinity (exact, upper)
    #[arg(long)]
    pub match_mode: Option<String>,

    /// Shelf selection for packed batches (first-fit, best-fit)
    #[arg(long)]
    pub packing: Option<String>,
}

/// Case selection shared by `run` and `partition`
#[derive(clap::Args, Debug, Default, Clone)]
pub struct SelectArgs {
    /// Only run these case ids and what they depend on
    #[arg(long = "only", value_name = "ID")]
    pub only: Vec<String>,

    /// Mask cases whose id does not contain this keyword
    #[arg(short, long)]
    pub keyword: Option<String>,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Suite file (JSON or YAML)
    pub suite: PathBuf,

    /// Units dispatched at the same time
    #[arg(short, long)]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub batch: BatchArgs,

    #[command(flatten)]
    pub select: SelectArgs,

    /// Stop the session after the first failing unit
    #[arg(long)]
    pub fail_fast: bool,

    /// Session timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Default per-case timeout in seconds
    #[arg(long)]
    pub case_timeout: Option<f64>,

    /// Directory for case output and status records
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Pool snapshot file
    #[arg(long)]
    pub pool: Option<PathBuf>,

    /// Share the pool through the broker named in this rendezvous file
    #[arg(long)]
    pub broker: Option<PathBuf>,

    /// Submit batches through this scheduler instead of running them in-process
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

/// Arguments for partition command
#[derive(Parser, Debug)]
pub struct PartitionArgs {
    /// Suite file (JSON or YAML)
    pub suite: PathBuf,

    #[command(flatten)]
    pub batch: BatchArgs,

    #[command(flatten)]
    pub select: SelectArgs,

    /// Pool snapshot used for node shape
    #[arg(long)]
    pub pool: Option<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

/// Arguments for pool management
#[derive(Parser, Debug)]
pub struct PoolArgs {
    #[command(subcommand)]
    pub action: PoolAction,
}

#[derive(Subcommand, Debug)]
pub enum PoolAction {
    /// Print capacities of a pool snapshot, or live usage from a broker
    Show {
        /// Pool snapshot file
        #[arg(long, conflicts_with = "broker")]
        pool: Option<PathBuf>,

        /// Query the broker named in this rendezvous file
        #[arg(long)]
        broker: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Write a uniform pool snapshot
    Init {
        /// Output file
        path: PathBuf,

        /// Number of nodes
        #[arg(short, long, default_value = "1")]
        nodes: usize,

        /// Slots per node as TYPE=COUNT (repeatable)
        #[arg(short, long = "slots", value_name = "TYPE=COUNT", default_value = "cpus=4")]
        slots: Vec<String>,
    },
}

/// Arguments for broker command
#[derive(Parser, Debug)]
pub struct BrokerArgs {
    /// Pool snapshot to serve
    #[arg(long)]
    pub pool: PathBuf,

    /// Rendezvous file to publish the listening address in
    #[arg(long)]
    pub rendezvous: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:0")]
    pub bind: String,
}

/// Arguments for status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Work directory of a session
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Export records to a CSV file
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "batchtest",
            "run",
            "suite.yaml",
            "--workers",
            "8",
            "--batch-duration",
            "600",
            "--affinity",
            "match",
            "--only",
            "a.n=1",
            "--only",
            "b",
            "--fail-fast",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.suite, PathBuf::from("suite.yaml"));
                assert_eq!(run.workers, Some(8));
                assert_eq!(run.batch.batch_duration, Some(600.0));
                assert_eq!(run.batch.affinity.as_deref(), Some("match"));
                assert_eq!(run.select.only, vec!["a.n=1", "b"]);
                assert!(run.fail_fast);
                assert_eq!(run.format, "table");
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_batch_strategies_conflict() {
        let result = Args::try_parse_from([
            "batchtest",
            "partition",
            "suite.yaml",
            "--batch-count",
            "3",
            "--batch-duration",
            "10",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_pool_init_args() {
        let args = Args::parse_from([
            "batchtest", "pool", "init", "pool.json", "--nodes", "2", "-s", "cpus=8", "-s",
            "gpus=1",
        ]);
        match args.command {
            Command::Pool(PoolArgs {
                action: PoolAction::Init { path, nodes, slots },
            }) => {
                assert_eq!(path, PathBuf::from("pool.json"));
                assert_eq!(nodes, 2);
                assert_eq!(slots, vec!["cpus=8", "gpus=1"]);
            }
            _ => panic!("Expected pool init"),
        }
    }

    #[test]
    fn test_broker_defaults() {
        let args = Args::parse_from([
            "batchtest",
            "broker",
            "--pool",
            "pool.json",
            "--rendezvous",
            "rv.json",
        ]);
        match args.command {
            Command::Broker(broker) => assert_eq!(broker.bind, "127.0.0.1:0"),
            _ => panic!("Expected Broker command"),
        }
    }
}
