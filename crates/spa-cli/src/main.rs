//! `spa` binary entry point

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use spa_cli::commands::{self, SandboxPaths};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .default_value("spa.toml")
        .value_parser(value_parser!(PathBuf))
        .help("Configuration file (.toml, .yaml or .yml)")
}

fn queue_dir_arg() -> Arg {
    Arg::new("queue-dir")
        .long("queue-dir")
        .default_value(".spa/queue")
        .value_parser(value_parser!(PathBuf))
        .help("Directory holding the review queue")
}

fn sandbox_args(command: Command) -> Command {
    command
        .arg(config_arg())
        .arg(
            Arg::new("fixture")
                .long("fixture")
                .default_value("fixture.json")
                .value_parser(value_parser!(PathBuf))
                .help("Usage fixture standing in for the provider APIs"),
        )
        .arg(queue_dir_arg())
        .arg(
            Arg::new("ledger")
                .long("ledger")
                .default_value(".spa/ledger.json")
                .value_parser(value_parser!(PathBuf))
                .help("Sandbox purchase ledger"),
        )
        .arg(
            Arg::new("at")
                .long("at")
                .value_parser(parse_timestamp)
                .help("Evaluate as of this RFC 3339 time instead of now"),
        )
}

fn cli() -> Command {
    Command::new("spa")
        .version(spa_cli::VERSION)
        .about("Savings Plan Autopilot: coverage-tracking commitment purchases with a review window")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit JSON output and JSON logs"),
        )
        .subcommand(
            sandbox_args(Command::new("plan").about("Run one planning pass and queue intents for review"))
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Report would-be purchases without queuing them"),
                )
                .arg(
                    Arg::new("live")
                        .long("live")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("dry-run")
                        .help("Queue intents even if the configuration says dry run"),
                ),
        )
        .subcommand(sandbox_args(
            Command::new("execute").about("Drain the review queue and purchase what still holds"),
        ))
        .subcommand(
            Command::new("validate")
                .about("Validate a configuration file")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("queue")
                .about("Inspect or edit the review queue")
                .subcommand_required(true)
                .arg(queue_dir_arg())
                .subcommand(Command::new("list").about("List pending intents"))
                .subcommand(Command::new("dead-letters").about("List dead-lettered messages"))
                .subcommand(
                    Command::new("cancel").about("Cancel a pending intent").arg(
                        Arg::new("token")
                            .required(true)
                            .help("Idempotency token of the intent"),
                    ),
                ),
        )
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn path(args: &ArgMatches, id: &str) -> Result<PathBuf> {
    args.get_one::<PathBuf>(id)
        .cloned()
        .with_context(|| format!("missing --{id}"))
}

fn sandbox_paths(args: &ArgMatches) -> Result<SandboxPaths> {
    Ok(SandboxPaths {
        config: path(args, "config")?,
        fixture: path(args, "fixture")?,
        queue_dir: path(args, "queue-dir")?,
        ledger: path(args, "ledger")?,
    })
}

fn now(args: &ArgMatches) -> DateTime<Utc> {
    args.get_one::<DateTime<Utc>>("at").copied().unwrap_or_else(Utc::now)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("cannot encode output")?);
    Ok(())
}

async fn run(matches: &ArgMatches, json: bool) -> Result<ExitCode> {
    match matches.subcommand() {
        Some(("plan", args)) => {
            let dry_run = if args.get_flag("dry-run") {
                Some(true)
            } else if args.get_flag("live") {
                Some(false)
            } else {
                None
            };
            let report = commands::plan(&sandbox_paths(args)?, dry_run, now(args)).await?;
            if json {
                print_json(&report)?;
            } else {
                print!("{}", commands::render_planning(&report));
            }
            Ok(if report.has_failures() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Some(("execute", args)) => {
            let summary = commands::execute(&sandbox_paths(args)?, now(args)).await?;
            if json {
                print_json(&summary)?;
            } else {
                print!("{}", commands::render_drain(&summary));
            }
            let clean = summary.is_clean() && summary.counts().failed == 0;
            Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Some(("validate", args)) => {
            let config = commands::validate(&path(args, "config")?)?;
            if json {
                print_json(&config)?;
            } else {
                println!(
                    "Configuration valid: {} categories, dry_run = {}",
                    config.categories.len(),
                    config.dry_run
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(("queue", args)) => {
            let queue_dir = path(args, "queue-dir")?;
            match args.subcommand() {
                Some(("list", _)) => {
                    let entries = commands::queue_list(&queue_dir).await?;
                    if json {
                        print_json(&entries)?;
                    } else {
                        print!("{}", commands::render_queue(&entries));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Some(("dead-letters", _)) => {
                    let dead = commands::queue_dead_letters(&queue_dir).await?;
                    if json {
                        print_json(&dead)?;
                    } else if dead.is_empty() {
                        println!("No dead letters");
                    } else {
                        for letter in &dead {
                            println!(
                                "{}  received {}x  {}",
                                letter.dead_lettered_at.to_rfc3339(),
                                letter.receive_count,
                                letter.reason
                            );
                        }
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Some(("cancel", sub)) => {
                    let token = sub.get_one::<String>("token").context("missing token")?;
                    let cancelled = commands::queue_cancel(&queue_dir, token).await?;
                    if json {
                        print_json(&serde_json::json!({ "token": token, "cancelled": cancelled }))?;
                    } else if cancelled {
                        println!("Cancelled {token}");
                    } else {
                        println!("No pending intent with token {token}");
                    }
                    Ok(if cancelled { ExitCode::SUCCESS } else { ExitCode::FAILURE })
                }
                _ => Ok(ExitCode::FAILURE),
            }
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    let json = matches.get_flag("json");
    init_tracing(json);

    match run(&matches, json).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
