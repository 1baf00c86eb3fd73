//! CLI command implementations
//!
//! Each invocation loads the config, installs logging, builds a cluster
//! over MySQL, runs one command, and prints one JSON response.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::json;
use tracing::info;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::harness::ExperimentKind;
use crate::model::{NewTitle, TitleChanges, TitleFilter, TitleId};
use crate::node::{IsolationLevel, NodeId};
use crate::observability::init_logging;

use super::args::{Cli, Command, ExperimentCommand, LogView};
use super::errors::{CliError, CliErrorCode, CliResult};
use super::io::{read_request, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_command(cli))
}

/// Load config, set up logging and the cluster, then dispatch.
pub async fn run_command(cli: Cli) -> CliResult<()> {
    let cluster = open_cluster(&cli.config)?;
    dispatch(&cluster, cli.command).await
}

fn open_cluster(config_path: &Path) -> CliResult<Cluster> {
    let config = Config::load(config_path)?;
    init_logging(config.logging.format, &config.logging.filter);
    Ok(Cluster::mysql(config)?)
}

pub async fn dispatch(cluster: &Cluster, command: Command) -> CliResult<()> {
    match command {
        Command::Init => init(cluster).await,
        Command::Health => write_response(&cluster.health().await),
        Command::Get { key } => {
            let title = cluster.get_by_key(&TitleId::new(key)).await?;
            write_response(&title)
        }
        Command::List {
            page,
            page_size,
            title_type,
        } => write_response(&cluster.list(page, page_size, title_type).await?),
        Command::Search {
            text,
            year_from,
            year_to,
            title_type,
            genres,
            page,
            page_size,
        } => {
            let filter = TitleFilter {
                text,
                year_from,
                year_to,
                title_type,
                genres,
            };
            write_response(&cluster.search(&filter, page, page_size).await?)
        }
        Command::Insert => {
            let fields: NewTitle = read_request()?;
            write_response(&cluster.insert(fields).await?)
        }
        Command::Update { key, isolation } => {
            let changes: TitleChanges = read_request()?;
            let isolation = isolation.unwrap_or(cluster.config().default_isolation);
            write_response(&cluster.update(&TitleId::new(key), changes, isolation).await?)
        }
        Command::Delete { key } => write_response(&cluster.delete(&TitleId::new(key)).await?),
        Command::Recover { node: Some(node) } => {
            write_response(&cluster.recover(&NodeId::new(node)).await?)
        }
        Command::Recover { node: None } => write_response(&cluster.recover_reachable().await),
        Command::Pending => write_response(&json!({
            "count": cluster.pending_count(),
            "by_node": cluster.pending_by_node(),
            "entries": cluster.pending(),
        })),
        Command::Logs { node, view, limit } => {
            let node = NodeId::new(node);
            let entries = match view {
                LogView::Recent => cluster.transaction_logs(&node, limit).await?,
                LogView::Pending => cluster.pending_logs(&node).await?,
                LogView::Failed => cluster.failed_logs(&node).await?,
            };
            write_response(&entries)
        }
        Command::Experiment { experiment } => run_experiment(cluster, experiment).await,
        Command::Watch => watch(cluster).await,
    }
}

/// Creates the tables on every node. Fails if any node failed.
async fn init(cluster: &Cluster) -> CliResult<()> {
    let results = cluster.init().await;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    let report: BTreeMap<NodeId, String> = results
        .into_iter()
        .map(|(node, result)| {
            let status = match result {
                Ok(()) => "ok".to_string(),
                Err(err) => err.to_string(),
            };
            (node, status)
        })
        .collect();
    write_response(&json!({ "initialized": failed == 0, "nodes": report }))?;
    if failed > 0 {
        return Err(CliError::new(
            CliErrorCode::NodeError,
            format!("schema creation failed on {} node(s)", failed),
        ));
    }
    Ok(())
}

async fn run_experiment(cluster: &Cluster, experiment: ExperimentCommand) -> CliResult<()> {
    let default_isolation = cluster.config().default_isolation;
    let level = |isolation: Option<IsolationLevel>| isolation.unwrap_or(default_isolation);
    match experiment {
        ExperimentCommand::Reads { key, isolation } => write_response(
            &cluster
                .run_concurrent_reads(&TitleId::new(key), level(isolation))
                .await?,
        ),
        ExperimentCommand::Conflict { key, isolation } => {
            let change_sets: Vec<TitleChanges> = read_request()?;
            write_response(
                &cluster
                    .run_read_write_conflict(&TitleId::new(key), change_sets, level(isolation))
                    .await?,
            )
        }
        ExperimentCommand::Writes { key, isolation } => {
            let change_sets: Vec<TitleChanges> = read_request()?;
            write_response(
                &cluster
                    .run_concurrent_writes(&TitleId::new(key), change_sets, level(isolation))
                    .await?,
            )
        }
        ExperimentCommand::Sweep { kind, key } => {
            let kind = ExperimentKind::from(kind);
            let change_sets: Vec<TitleChanges> = match kind {
                ExperimentKind::Reads => Vec::new(),
                _ => read_request()?,
            };
            write_response(
                &cluster
                    .run_isolation_sweep(kind, &TitleId::new(key), change_sets)
                    .await?,
            )
        }
    }
}

/// Runs recovery in the background until interrupted.
async fn watch(cluster: &Cluster) -> CliResult<()> {
    let reloaded = cluster.start().await?;
    cluster.start_auto_recovery();
    info!(reloaded, "watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    cluster.shutdown().await;
    write_response(&json!({
        "reloaded": reloaded,
        "pending": cluster.pending_count(),
        "metrics": cluster.metrics(),
    }))
}
