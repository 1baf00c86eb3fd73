//! CLI argument definitions using clap
//!
//! Every command reads the cluster layout from `--config`. Commands that
//! take a record body (`insert`, `update`, change sets for experiments)
//! read one JSON document from stdin.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::harness::ExperimentKind;
use crate::model::TitleType;
use crate::node::IsolationLevel;

/// fragdb - replicated title store over fragment nodes and a central replica
#[derive(Parser, Debug)]
#[command(name = "fragdb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./fragdb.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the tables on every node
    Init,

    /// Probe every node
    Health,

    /// Fetch one title by key
    Get { key: String },

    /// List titles, optionally of one type
    List {
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        page_size: u64,
        #[arg(long)]
        title_type: Option<TitleType>,
    },

    /// Search titles
    Search {
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        year_from: Option<i32>,
        #[arg(long)]
        year_to: Option<i32>,
        #[arg(long)]
        title_type: Option<TitleType>,
        /// Required genre; repeat for several
        #[arg(long = "genre")]
        genres: Vec<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        page_size: u64,
    },

    /// Insert a title read from stdin
    Insert,

    /// Update a title with changes read from stdin
    Update {
        key: String,
        #[arg(long)]
        isolation: Option<IsolationLevel>,
    },

    /// Delete a title
    Delete { key: String },

    /// Replay pending replications toward a node
    Recover {
        /// Node id; every reachable node when omitted
        node: Option<String>,
    },

    /// Show the in-memory pending queue
    Pending,

    /// Show a node's transaction log
    Logs {
        node: String,
        #[arg(long, value_enum, default_value_t = LogView::Recent)]
        view: LogView,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Run a concurrency experiment
    Experiment {
        #[command(subcommand)]
        experiment: ExperimentCommand,
    },

    /// Wait for nodes, reload pending entries, and recover until Ctrl-C
    Watch,
}

#[derive(Subcommand, Debug)]
pub enum ExperimentCommand {
    /// Concurrent readers on Central and the owning fragment
    Reads {
        key: String,
        #[arg(long)]
        isolation: Option<IsolationLevel>,
    },

    /// Writers holding an update open against double readers
    Conflict {
        key: String,
        #[arg(long)]
        isolation: Option<IsolationLevel>,
    },

    /// Writers contending on one key
    Writes {
        key: String,
        #[arg(long)]
        isolation: Option<IsolationLevel>,
    },

    /// One experiment at every isolation level
    Sweep {
        #[arg(value_enum)]
        kind: SweepKind,
        key: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogView {
    Recent,
    Pending,
    Failed,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepKind {
    Reads,
    Conflict,
    Writes,
}

impl From<SweepKind> for ExperimentKind {
    fn from(kind: SweepKind) -> Self {
        match kind {
            SweepKind::Reads => ExperimentKind::Reads,
            SweepKind::Conflict => ExperimentKind::Conflict,
            SweepKind::Writes => ExperimentKind::Writes,
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_with_isolation() {
        let cli = Cli::try_parse_from([
            "fragdb",
            "--config",
            "cluster.json",
            "update",
            "tt0000042",
            "--isolation",
            "repeatable-read",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("cluster.json"));
        match cli.command {
            Command::Update { key, isolation } => {
                assert_eq!(key, "tt0000042");
                assert_eq!(isolation, Some(IsolationLevel::RepeatableRead));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_genres() {
        let cli = Cli::try_parse_from([
            "fragdb", "search", "--genre", "Drama", "--genre", "Comedy", "--title-type", "movie",
        ])
        .unwrap();
        match cli.command {
            Command::Search {
                genres, title_type, ..
            } => {
                assert_eq!(genres, vec!["Drama", "Comedy"]);
                assert_eq!(title_type, Some(TitleType::Movie));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_sweep() {
        let cli = Cli::try_parse_from(["fragdb", "experiment", "sweep", "writes", "tt0000001"]).unwrap();
        match cli.command {
            Command::Experiment {
                experiment: ExperimentCommand::Sweep { kind, key },
            } => {
                assert_eq!(ExperimentKind::from(kind), ExperimentKind::Writes);
                assert_eq!(key, "tt0000001");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
