//! CLI argument definitions for Quartermaster.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Quartermaster - keeps a QA team's sprint test cases and automation backlog in step
/// with the issue tracker and the test-bank.
///
/// Start with `qm init`, then `qm sync <sprint>`.
#[derive(Parser, Debug)]
#[command(name = "qm")]
#[command(author, version, about = "Sprint test-case reconciliation for QA teams", long_about = None)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("QM_GIT_COMMIT"),
    ", built ",
    env!("QM_BUILD_TIMESTAMP"),
    ")"
))]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Data directory holding quartermaster.db and the workspace config.kdl
    #[arg(short = 'D', long = "data-dir", global = true, env = "QM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log progress at info level (QM_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and seed reference data (idempotent)
    Init,

    /// List tracker sprints
    Sprints {
        /// Tracker project key (defaults to tracker.project-key)
        #[arg(long)]
        project_key: Option<String>,

        /// Board id (defaults to tracker.board-id, else the project's first board)
        #[arg(long)]
        board_id: Option<String>,
    },

    /// Synchronize a sprint from the tracker
    #[command(args_conflicts_with_subcommands = true)]
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,

        #[command(flatten)]
        args: SyncArgs,
    },

    /// List stored issues of a sprint
    Issues {
        /// Sprint id
        sprint: String,
    },

    /// Issue commands
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },

    /// Test-case link commands
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },

    /// Automation readiness statistics for a sprint
    Stats {
        /// Sprint id
        sprint: String,
    },

    /// Automation backlog commands
    Backlog {
        #[command(subcommand)]
        command: BacklogCommands,
    },

    /// Reference data commands
    Lookup {
        #[command(subcommand)]
        command: LookupCommands,
    },

    /// Project commands
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Tester commands
    Tester {
        #[command(subcommand)]
        command: TesterCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Check configuration and connectivity
    Doctor,
}

/// Arguments of `qm sync <sprint>`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Sprint id
    pub sprint: Option<String>,

    /// Tracker project key (defaults to tracker.project-key)
    #[arg(long)]
    pub project_key: Option<String>,

    /// Board id (defaults to tracker.board-id)
    #[arg(long)]
    pub board_id: Option<String>,

    /// Replay a JSON array of issues instead of calling the tracker
    #[arg(long, value_name = "FILE")]
    pub from_file: Option<PathBuf>,

    /// Worker threads (1-16, defaults to sync.workers)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub workers: Option<u8>,
}

/// Sync subcommands
#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Show recorded sync runs, newest first
    History {
        /// Only runs of this sprint
        #[arg(long)]
        sprint: Option<String>,

        /// Maximum number of runs
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Issue subcommands
#[derive(Subcommand, Debug)]
pub enum IssueCommands {
    /// Show an issue with its linked test cases
    Show {
        /// Issue key (e.g., QA-123)
        key: String,
    },

    /// Count a keyword in the issue's tracker comments and store the result
    Keyword {
        /// Issue key (e.g., QA-123)
        key: String,

        /// Keyword to count (case-insensitive)
        keyword: String,
    },
}

/// Link subcommands
#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Set the automation flags of a link
    Flags {
        /// Link id
        id: i64,

        /// The case can be automated
        #[arg(long)]
        can: bool,

        /// The case cannot be automated
        #[arg(long)]
        cannot: bool,
    },

    /// Assign a link to a project, tester and classification
    Map {
        /// Link id
        id: i64,

        /// Project id or name
        #[arg(long)]
        project: Option<String>,

        /// Tester id or name
        #[arg(long)]
        tester: Option<String>,

        /// Manual tester id or name
        #[arg(long)]
        manual_tester: Option<String>,

        /// Test case type code (e.g., Regression)
        #[arg(long = "type")]
        test_case_type: Option<String>,

        /// Tool type code (e.g., Playwright)
        #[arg(long)]
        tool: Option<String>,

        /// Free-form notes (empty string clears)
        #[arg(long)]
        notes: Option<String>,
    },
}

/// Backlog subcommands
#[derive(Subcommand, Debug)]
pub enum BacklogCommands {
    /// List backlog entries
    List {
        /// Only entries with this workflow status code
        #[arg(long)]
        status: Option<String>,
    },
}

/// Lookup subcommands
#[derive(Subcommand, Debug)]
pub enum LookupCommands {
    /// List rows of a category (active rows only unless --all)
    List {
        /// Category (priority, workflow-status, automation-status, test-case-type,
        /// tool-type, build-status, role)
        category: String,

        /// Include inactive rows
        #[arg(long)]
        all: bool,
    },

    /// Resolve a code, falling back to the category default
    Resolve {
        /// Category
        category: String,

        /// Code (omit for the default)
        code: Option<String>,
    },
}

/// Project subcommands
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Add a project
    Add {
        /// Project name
        name: String,

        /// Domain name (created if missing)
        #[arg(long)]
        domain: Option<String>,

        /// Description
        #[arg(long)]
        description: Option<String>,

        /// Tracker project key
        #[arg(long)]
        project_key: Option<String>,

        /// Tracker board id
        #[arg(long)]
        board_id: Option<String>,
    },

    /// List projects
    List,
}

/// Tester subcommands
#[derive(Subcommand, Debug)]
pub enum TesterCommands {
    /// Add a tester
    Add {
        /// Tester name
        name: String,

        /// Role code (defaults to the first role)
        #[arg(long)]
        role: Option<String>,
    },

    /// List testers
    List,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved configuration with sources (secrets masked)
    Show,

    /// Set a value in the workspace config.kdl (empty value unsets)
    Set {
        /// Dotted key (e.g., tracker.url, sync.workers)
        key: String,

        /// Value
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_with_flags() {
        let cli = Cli::try_parse_from(["qm", "sync", "42", "--workers", "3", "-H"]).unwrap();
        assert!(cli.human_readable);
        match cli.command {
            Commands::Sync { command: None, args } => {
                assert_eq!(args.sprint.as_deref(), Some("42"));
                assert_eq!(args.workers, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sync_history() {
        let cli = Cli::try_parse_from(["qm", "sync", "history", "--limit", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                command: Some(SyncCommands::History { limit: 5, .. }),
                ..
            }
        ));
    }

    #[test]
    fn test_workers_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["qm", "sync", "42", "--workers", "17"]).is_err());
    }

    #[test]
    fn test_parse_link_map() {
        let cli = Cli::try_parse_from([
            "qm", "link", "map", "7", "--project", "Shop", "--type", "Smoke",
        ])
        .unwrap();
        match cli.command {
            Commands::Link {
                command:
                    LinkCommands::Map {
                        id,
                        project,
                        test_case_type,
                        ..
                    },
            } => {
                assert_eq!(id, 7);
                assert_eq!(project.as_deref(), Some("Shop"));
                assert_eq!(test_case_type.as_deref(), Some("Smoke"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
