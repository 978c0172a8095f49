//! batchtest - dependency-aware batch test orchestrator
//!
//! Expands a parameterized suite into test cases, resolves their dependencies,
//! groups ready cases into batches and runs them under a shared, typed resource
//! pool, either in-process or through a batch scheduler.
//!
//! ## Features
//!
//! - Dependency graph with failure propagation and masking
//! - Batching by count, by duration with node affinity, or by 2-D packing
//! - Cancellable, fair resource arbitration shared across sessions by a broker
//! - Per-case status records persisted atomically in the work directory
//!
//! ## Usage
//!
//! ```bash
//! # Run a suite on 8 workers, grouping cases into 10-minute batches
//! batchtest run suite.yaml --workers 8 --batch-duration 600
//!
//! # Preview the batches a strategy would produce
//! batchtest partition suite.yaml --batch-pack 16:3600
//!
//! # Share one pool between sessions
//! batchtest broker --pool pool.json --rendezvous /tmp/batchtest.rv
//! batchtest run suite.yaml --broker /tmp/batchtest.rv
//!
//! # Show persisted results
//! batchtest status --work-dir batchtest-work --export results.csv
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, FromArgMatches};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod batch;
mod cli;
mod config;
mod error;
mod executor;
mod graph;
mod models;
mod output;
mod resource;
mod results;
mod suite;
mod utils;

use batch::{MatchMode, NodeShape, PackingStrategy, Strategy};
use cli::{Args, BatchArgs};
use config::{EnvConfig, SessionConfig};
use executor::{Driver, Registry};
use models::{CaseId, NodeAffinity, TestCase, RUNNER_ERROR_EXIT_CODE};
use output::{OutputFormat, ResultFormatter};
use resource::{
    BrokerClient, PoolSnapshot, Rendezvous, ResourceArbiter, ResourceBroker, ResourceProvider,
};
use results::{export_csv, JsonStatusStore, SessionRecord, StatusStore};
use suite::{build_graph, Suite};
use utils::{init_logger, LogLevel};

#[tokio::main]
async fn main() {
    let matches = Args::command()
        .after_long_help(config::env_help())
        .get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let env = EnvConfig::load();
    init_logger(LogLevel::from_verbosity(args.verbose), env.log.as_deref());

    let code = match dispatch(args, env).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            RUNNER_ERROR_EXIT_CODE
        }
    };
    std::process::exit(code);
}

async fn dispatch(args: Args, env: EnvConfig) -> Result<i32> {
    let config = load_config(args.config.as_deref(), &env)?;

    match args.command {
        cli::Command::Run(run_args) => run_suite(run_args, config).await,
        cli::Command::Partition(partition_args) => show_partition(partition_args, config),
        cli::Command::Pool(pool_args) => manage_pool(pool_args, &config).await,
        cli::Command::Broker(broker_args) => serve_broker(broker_args).await,
        cli::Command::Status(status_args) => show_status(status_args, &config),
    }
}

/// Defaults, then the config file, then `BATCHTEST_*` variables
fn load_config(explicit: Option<&Path>, env: &EnvConfig) -> Result<SessionConfig> {
    let from_env = env.config_file.as_deref().map(config::expand_path);
    let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
        Some(path) => SessionConfig::load(&path)?,
        None => SessionConfig::load_default()?,
    };
    if env.has_any() {
        config.apply_env(env);
    }
    Ok(config)
}

fn parse_format(s: &str) -> Result<OutputFormat> {
    OutputFormat::from_str(s).ok_or_else(|| anyhow!("Unknown output format: {s}"))
}

fn parse_pack(s: &str) -> Result<(u32, f64)> {
    let (width, height) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected W:H for --batch-pack, got '{s}'"))?;
    let width = width
        .trim()
        .parse()
        .with_context(|| format!("Invalid bin width '{width}'"))?;
    let height = height
        .trim()
        .parse()
        .with_context(|| format!("Invalid bin height '{height}'"))?;
    Ok((width, height))
}

/// Overlay the batching flags onto the configured strategy
fn apply_batch_args(config: &mut SessionConfig, args: &BatchArgs) -> Result<()> {
    let affinity = args
        .affinity
        .as_deref()
        .map(|s| NodeAffinity::from_str(s).ok_or_else(|| anyhow!("Unknown affinity: {s}")))
        .transpose()?;
    let match_mode = args
        .match_mode
        .as_deref()
        .map(|s| MatchMode::from_str(s).ok_or_else(|| anyhow!("Unknown match mode: {s}")))
        .transpose()?;
    let packing = args
        .packing
        .as_deref()
        .map(|s| PackingStrategy::from_str(s).ok_or_else(|| anyhow!("Unknown packing: {s}")))
        .transpose()?;

    let (base_affinity, base_match, base_packing) = match &config.batching {
        Strategy::Duration {
            affinity,
            match_mode,
            ..
        } => (*affinity, *match_mode, PackingStrategy::default()),
        Strategy::Pack { packing, .. } => (NodeAffinity::default(), MatchMode::default(), *packing),
        _ => Default::default(),
    };
    let affinity = affinity.unwrap_or(base_affinity);
    let match_mode = match_mode.unwrap_or(base_match);
    let packing = packing.unwrap_or(base_packing);

    config.batching = if let Some(count) = args.batch_count {
        Strategy::Count { count }
    } else if let Some(limit) = args.batch_duration {
        Strategy::Duration {
            limit,
            affinity,
            match_mode,
        }
    } else if let Some(pack) = &args.batch_pack {
        let (width, height) = parse_pack(pack)?;
        Strategy::Pack {
            width,
            height,
            packing,
        }
    } else {
        match config.batching.clone() {
            Strategy::Duration { limit, .. } => Strategy::Duration {
                limit,
                affinity,
                match_mode,
            },
            Strategy::Pack { width, height, .. } => Strategy::Pack {
                width,
                height,
                packing,
            },
            other => other,
        }
    };
    config.exempt_composite |= args.exempt_composite;
    Ok(())
}

/// The given snapshot, or one node with a `cpus` slot per available core
fn load_pool(path: Option<&Path>) -> Result<PoolSnapshot> {
    match path {
        Some(path) => PoolSnapshot::load(path),
        None => {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1);
            info!(cores, "No pool snapshot given, using local cores");
            Ok(PoolSnapshot::uniform(
                1,
                &BTreeMap::from([("cpus".to_string(), cores)]),
            ))
        }
    }
}

fn interrupt_on_ctrl_c(token: CancellationToken, what: &'static str) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping {}", what);
            token.cancel();
        }
    });
}

async fn run_suite(args: cli::RunArgs, mut config: SessionConfig) -> Result<i32> {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    apply_batch_args(&mut config, &args.batch)?;
    config.fail_fast |= args.fail_fast;
    if args.timeout.is_some() {
        config.timeout = args.timeout;
    }
    if args.case_timeout.is_some() {
        config.case_timeout = args.case_timeout;
    }
    if let Some(dir) = args.work_dir {
        config.work_dir = dir;
    }
    config.work_dir = std::path::absolute(&config.work_dir)
        .with_context(|| format!("Invalid work directory: {}", config.work_dir.display()))?;
    if args.pool.is_some() {
        config.pool = args.pool;
    }
    if args.broker.is_some() {
        config.broker = args.broker;
    }
    if args.scheduler.is_some() {
        config.scheduler = args.scheduler;
    }
    config.validate()?;
    let format = parse_format(&args.format)?;

    let suite = Suite::load(&args.suite)?;
    let only: Vec<CaseId> = args.select.only.iter().map(CaseId::new).collect();
    let graph = build_graph(&suite, args.select.keyword.as_deref(), &only)?;
    info!(cases = graph.len(), suite = %args.suite.display(), "Suite loaded");

    let (resources, snapshot): (Arc<dyn ResourceProvider>, PoolSnapshot) = match &config.broker {
        Some(rendezvous) => {
            let client = BrokerClient::connect_rendezvous(rendezvous).await?;
            let snapshot = client.snapshot().await?;
            info!(rendezvous = %rendezvous.display(), "Sharing pool through broker");
            (Arc::new(client), snapshot)
        }
        None => {
            let snapshot = load_pool(config.pool.as_deref())?;
            let arbiter =
                ResourceArbiter::from_snapshot(&snapshot)?.with_max_bypass(config.max_bypass);
            (Arc::new(arbiter), snapshot)
        }
    };
    snapshot.save(config.work_dir.join("pool.json"))?;

    let registry = Registry::with_builtins();
    let runner = registry.runner(&config.runner)?;
    let scheduler = config
        .scheduler
        .as_deref()
        .map(|name| registry.scheduler(name))
        .transpose()?;

    let store: Arc<dyn StatusStore> = Arc::new(JsonStatusStore::new(&config.work_dir));
    let driver_config = config.driver_config(NodeShape::from_snapshot(&snapshot));
    let mut driver = Driver::new(graph, resources, runner, driver_config)?.with_store(store);
    if let Some(scheduler) = scheduler {
        driver = driver.with_scheduler(scheduler);
    }

    interrupt_on_ctrl_c(driver.cancel_token(), "session");
    let summary = driver.run().await?;

    SessionRecord::new(summary.clone(), config.batching.to_string(), config.workers)
        .save(&config.work_dir)?;
    println!("{}", ResultFormatter::new(format).format_summary(&summary));

    Ok(summary.exit_code)
}

fn show_partition(args: cli::PartitionArgs, mut config: SessionConfig) -> Result<i32> {
    apply_batch_args(&mut config, &args.batch)?;
    config.validate()?;
    let format = parse_format(&args.format)?;

    let suite = Suite::load(&args.suite)?;
    let only: Vec<CaseId> = args.select.only.iter().map(CaseId::new).collect();
    let graph = build_graph(&suite, args.select.keyword.as_deref(), &only)?;

    let snapshot = load_pool(args.pool.as_deref().or(config.pool.as_deref()))?;
    let partitioner = config.partitioner(NodeShape::from_snapshot(&snapshot));

    let cases: Vec<TestCase> = graph
        .topological_order()?
        .iter()
        .filter_map(|id| graph.get(id))
        .filter(|case| !case.is_masked())
        .cloned()
        .collect();
    let batches = partitioner.partition(&cases)?;

    println!("{}", ResultFormatter::new(format).format_plan(&batches));
    Ok(0)
}

async fn manage_pool(args: cli::PoolArgs, config: &SessionConfig) -> Result<i32> {
    match args.action {
        cli::PoolAction::Show {
            pool,
            broker,
            format,
        } => {
            let format = parse_format(&format)?;
            let usage = match broker.or_else(|| config.broker.clone()) {
                Some(rendezvous) if pool.is_none() => {
                    BrokerClient::connect_rendezvous(&rendezvous)
                        .await?
                        .usage()
                        .await?
                }
                _ => {
                    let snapshot = load_pool(pool.as_deref().or(config.pool.as_deref()))?;
                    ResourceArbiter::from_snapshot(&snapshot)?.usage().await
                }
            };
            println!("{}", ResultFormatter::new(format).format_usage(&usage));
        }
        cli::PoolAction::Init { path, nodes, slots } => {
            if nodes == 0 {
                bail!("A pool needs at least one node");
            }
            let mut per_node = BTreeMap::new();
            for spec in &slots {
                let (rtype, count) = spec
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Expected TYPE=COUNT, got '{spec}'"))?;
                let count: u32 = count
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid slot count in '{spec}'"))?;
                per_node.insert(rtype.trim().to_string(), count);
            }
            let snapshot = PoolSnapshot::uniform(nodes, &per_node);
            // Reject layouts the pool would refuse at session start
            ResourceArbiter::from_snapshot(&snapshot)?;
            snapshot.save(&path)?;
            info!(path = %path.display(), nodes, "Wrote pool snapshot");
        }
    }
    Ok(0)
}

async fn serve_broker(args: cli::BrokerArgs) -> Result<i32> {
    let snapshot = PoolSnapshot::load(&args.pool)?;
    let arbiter = ResourceArbiter::from_snapshot(&snapshot)?;
    let broker = ResourceBroker::new(Arc::new(arbiter));

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    let addr = listener.local_addr()?;
    Rendezvous::new(addr).write(&args.rendezvous)?;
    info!(%addr, rendezvous = %args.rendezvous.display(), "Broker published");

    interrupt_on_ctrl_c(broker.shutdown_token(), "broker");
    let served = broker.serve(listener).await;

    if let Err(e) = std::fs::remove_file(&args.rendezvous) {
        warn!("Failed to remove rendezvous file: {}", e);
    }
    served?;
    Ok(0)
}

fn show_status(args: cli::StatusArgs, config: &SessionConfig) -> Result<i32> {
    let format = parse_format(&args.format)?;
    let work_dir = args.work_dir.unwrap_or_else(|| config.work_dir.clone());

    let store = JsonStatusStore::new(&work_dir);
    let records = store.all()?;
    if records.is_empty() {
        warn!("No status records under {}", store.dir().display());
    }

    match SessionRecord::load(&work_dir) {
        Ok(session) => info!(
            session = %session.summary.session_id,
            state = %session.summary.state,
            exit_code = session.summary.exit_code,
            "Last session"
        ),
        Err(e) => info!("No session record: {:#}", e),
    }

    println!("{}", ResultFormatter::new(format).format_records(&records));

    if let Some(path) = args.export {
        export_csv(&records, &path)?;
        info!(path = %path.display(), records = records.len(), "Exported records");
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pack() {
        assert_eq!(parse_pack("16:3600").unwrap(), (16, 3600.0));
        assert!(parse_pack("16").is_err());
        assert!(parse_pack("x:1").is_err());
    }

    #[test]
    fn test_batch_args_select_strategy() {
        let mut config = SessionConfig::default();
        let args = BatchArgs {
            batch_duration: Some(300.0),
            affinity: Some("same".into()),
            ..Default::default()
        };
        apply_batch_args(&mut config, &args).unwrap();
        assert_eq!(
            config.batching,
            Strategy::Duration {
                limit: 300.0,
                affinity: NodeAffinity::Same,
                match_mode: MatchMode::Exact,
            }
        );
    }

    #[test]
    fn test_batch_args_refine_configured_strategy() {
        let mut config = SessionConfig {
            batching: Strategy::Pack {
                width: 8,
                height: 60.0,
                packing: PackingStrategy::FirstFit,
            },
            ..Default::default()
        };
        let args = BatchArgs {
            packing: Some("best-fit".into()),
            exempt_composite: true,
            ..Default::default()
        };
        apply_batch_args(&mut config, &args).unwrap();
        assert_eq!(
            config.batching,
            Strategy::Pack {
                width: 8,
                height: 60.0,
                packing: PackingStrategy::BestFit,
            }
        );
        assert!(config.exempt_composite);
    }

    #[test]
    fn test_batch_args_reject_unknown_names() {
        let mut config = SessionConfig::default();
        let args = BatchArgs {
            affinity: Some("nearby".into()),
            ..Default::default()
        };
        assert!(apply_batch_args(&mut config, &args).is_err());
    }

    #[test]
    fn test_default_pool_uses_local_cores() {
        let snapshot = load_pool(None).unwrap();
        assert_eq!(snapshot.nodes(), 1);
        assert!(snapshot.capacity("cpus").unwrap() >= 1);
        assert_eq!(snapshot.capacity("cpu"), None);

        let case = TestCase::new("t").with_resource(models::ResourceDemand::cpus(1));
        let pool = resource::ResourcePool::from_snapshot(&snapshot).unwrap();
        assert!(pool.satisfiable(&case.resources).unwrap());
    }
}
