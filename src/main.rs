//! Quartermaster CLI - sprint test-case reconciliation for QA teams.

use clap::Parser;
use quartermaster::cli::{
    BacklogCommands, Cli, Commands, ConfigCommands, IssueCommands, LinkCommands, LookupCommands,
    ProjectCommands, SyncArgs, SyncCommands, TesterCommands,
};
use quartermaster::commands::{self, MapArgs, NewProjectArgs, Output};
use quartermaster::config::{self, OutputFormat};
use quartermaster::reconcile::{CancelFlag, SyncRequest};
use quartermaster::storage::get_data_dir;
use quartermaster::tracker::{FileTracker, TrackerClient};
use quartermaster::{Error, Result};
use std::path::Path;
use std::process;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut human = cli.human_readable;
    let data_dir = match cli.data_dir {
        Some(dir) => Ok(dir),
        None => get_data_dir(),
    };
    let result = data_dir.and_then(|data_dir| {
        if !human {
            human = prefers_human(&data_dir);
        }
        run_command(cli.command, &data_dir, human)
    });

    if let Err(e) = result {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

/// Logs go to stderr; `QM_LOG` wins over `RUST_LOG`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("QM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// `output-format "human"` in config.kdl turns on human output without `-H`.
fn prefers_human(data_dir: &Path) -> bool {
    match config::load(data_dir) {
        Ok(resolved) => resolved.output_format.value == OutputFormat::Human,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable configuration for output format");
            false
        }
    }
}

fn run_command(command: Commands, data_dir: &Path, human: bool) -> Result<()> {
    match command {
        Commands::Init => output(&commands::init(data_dir)?, human),

        Commands::Sprints {
            project_key,
            board_id,
        } => {
            let resolved = config::load(data_dir)?;
            let tracker = commands::tracker_client(&resolved)?;
            let project_key = project_key.or_else(|| resolved.tracker_project_key().map(str::to_string));
            let board_id = board_id.or_else(|| resolved.tracker_board_id().map(str::to_string));
            output(
                &commands::sprints(&tracker, project_key.as_deref(), board_id.as_deref())?,
                human,
            )
        }

        Commands::Sync { command, args } => match command {
            Some(SyncCommands::History { sprint, limit }) => {
                output(&commands::sync_history(data_dir, sprint.as_deref(), limit)?, human)
            }
            None => run_sync(args, data_dir, human)?,
        },

        Commands::Issues { sprint } => output(&commands::issues(data_dir, &sprint)?, human),

        Commands::Issue { command } => match command {
            IssueCommands::Show { key } => output(&commands::issue_show(data_dir, &key)?, human),
            IssueCommands::Keyword { key, keyword } => {
                let resolved = config::load(data_dir)?;
                let tracker = commands::tracker_client(&resolved)?;
                output(
                    &commands::issue_keyword(data_dir, &tracker, &key, &keyword)?,
                    human,
                )
            }
        },

        Commands::Link { command } => match command {
            LinkCommands::Flags { id, can, cannot } => {
                output(&commands::link_flags(data_dir, id, can, cannot)?, human)
            }
            LinkCommands::Map {
                id,
                project,
                tester,
                manual_tester,
                test_case_type,
                tool,
                notes,
            } => {
                let args = MapArgs {
                    link_id: id,
                    project,
                    tester,
                    manual_tester,
                    test_case_type,
                    tool_type: tool,
                    notes,
                };
                output(&commands::link_map(data_dir, args)?, human)
            }
        },

        Commands::Stats { sprint } => output(&commands::stats(data_dir, &sprint)?, human),

        Commands::Backlog { command } => match command {
            BacklogCommands::List { status } => {
                output(&commands::backlog_list(data_dir, status.as_deref())?, human)
            }
        },

        Commands::Lookup { command } => match command {
            LookupCommands::List { category, all } => {
                output(&commands::lookup_list(data_dir, &category, all)?, human)
            }
            LookupCommands::Resolve { category, code } => output(
                &commands::lookup_resolve(data_dir, &category, code.as_deref())?,
                human,
            ),
        },

        Commands::Project { command } => match command {
            ProjectCommands::Add {
                name,
                domain,
                description,
                project_key,
                board_id,
            } => {
                let project = NewProjectArgs {
                    name,
                    domain,
                    description,
                    project_key,
                    board_id,
                };
                output(&commands::project_add(data_dir, project)?, human)
            }
            ProjectCommands::List => output(&commands::project_list(data_dir)?, human),
        },

        Commands::Tester { command } => match command {
            TesterCommands::Add { name, role } => {
                output(&commands::tester_add(data_dir, &name, role.as_deref())?, human)
            }
            TesterCommands::List => output(&commands::tester_list(data_dir)?, human),
        },

        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let resolved = config::load(data_dir)?;
                output(&commands::config_show(data_dir, &resolved), human)
            }
            ConfigCommands::Set { key, value } => {
                output(&commands::config_set(data_dir, &key, &value)?, human)
            }
        },

        Commands::Doctor => {
            let resolved = config::load(data_dir)?;
            output(&commands::doctor(data_dir, &resolved)?, human)
        }
    }
    Ok(())
}

fn run_sync(args: SyncArgs, data_dir: &Path, human: bool) -> Result<()> {
    let sprint_id = args
        .sprint
        .ok_or_else(|| Error::InvalidInput("Sprint id is required (qm sync <sprint>)".to_string()))?;
    let resolved = config::load(data_dir)?;

    let tracker: Box<dyn TrackerClient> = match args.from_file {
        Some(path) => Box::new(FileTracker::new(path)),
        None => Box::new(commands::tracker_client(&resolved)?),
    };
    let test_bank = commands::test_bank_client(&resolved);

    let request = SyncRequest {
        sprint_id,
        project_key: args
            .project_key
            .or_else(|| resolved.tracker_project_key().map(str::to_string)),
        board_id: args
            .board_id
            .or_else(|| resolved.tracker_board_id().map(str::to_string)),
    };
    let workers = args.workers.map(usize::from).unwrap_or(resolved.workers());

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight issues");
        handler_flag.cancel();
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }

    let report = commands::sync(
        data_dir,
        tracker.as_ref(),
        test_bank.as_ref(),
        &request,
        workers,
        cancel,
    )?;
    output(&report, human);
    Ok(())
}

/// Print output in JSON or human-readable format.
fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
