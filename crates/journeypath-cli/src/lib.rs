//! Stable embedded JourneyPath command surface for host runtimes.
//!
//! Host projects should embed attribution behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`JourneyCommand`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteSessionStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use journeypath_core::{now_utc, parse_date, parse_rfc3339_utc, PathRecord};
use journeypath_store_sqlite::{AttributionRunReport, SessionFactInput, SqliteSessionStore};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "jp")]
#[command(about = "JourneyPath session attribution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./journeypath.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: JourneyCommand,
}

#[derive(Debug, Subcommand)]
pub enum JourneyCommand {
    Sessions {
        #[command(subcommand)]
        command: Box<SessionsCommand>,
    },
    Attribution {
        #[command(subcommand)]
        command: Box<AttributionCommand>,
    },
    Paths {
        #[command(subcommand)]
        command: Box<PathsCommand>,
    },
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
    Rulesets {
        #[command(subcommand)]
        command: Box<RulesetsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    Log(LogArgs),
    List(SessionsListArgs),
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    session_date: String,
    #[arg(long)]
    event_time: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    membership: bool,
    #[arg(long)]
    medium: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    campaign: Option<String>,
    #[arg(long)]
    channel_group: Option<String>,
    #[arg(long)]
    not_engaged: bool,
}

#[derive(Debug, Args)]
pub struct SessionsListArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum AttributionCommand {
    Run(AttributionRunArgs),
}

#[derive(Debug, Args)]
pub struct AttributionRunArgs {
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long, default_value_t = 1)]
    ruleset_version: u32,
    #[arg(long)]
    lookback_days: Option<u32>,
    #[arg(long)]
    gap_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum PathsCommand {
    List(PathsListArgs),
}

#[derive(Debug, Args)]
pub struct PathsListArgs {
    #[arg(long)]
    dimension: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    Show(RunsShowArgs),
}

#[derive(Debug, Args)]
pub struct RunsShowArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetsCommand {
    Show(RulesetsShowArgs),
}

#[derive(Debug, Args)]
pub struct RulesetsShowArgs {
    #[arg(long, default_value_t = 1)]
    ruleset_version: u32,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &std::path::Path, command: JourneyCommand) -> Result<()> {
    let mut store = SqliteSessionStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, persistence, or the attribution
/// run fails.
pub fn run_command(command: JourneyCommand, store: &mut SqliteSessionStore) -> Result<()> {
    match command {
        JourneyCommand::Sessions { command } => run_sessions(*command, store),
        JourneyCommand::Attribution { command } => run_attribution_command(*command, store),
        JourneyCommand::Paths { command } => run_paths(*command, store),
        JourneyCommand::Runs { command } => run_runs(*command, store),
        JourneyCommand::Rulesets { command } => run_rulesets(*command, store),
    }
}

fn run_sessions(command: SessionsCommand, store: &mut SqliteSessionStore) -> Result<()> {
    match command {
        SessionsCommand::Log(args) => {
            let session_date = parse_date_arg(&args.session_date)?;
            let input = SessionFactInput {
                session_id: match args.session_id.as_deref() {
                    Some(raw) => Some(parse_session_id(raw)?),
                    None => None,
                },
                user_id: args.user_id,
                session_date,
                event_time: parse_optional_utc(
                    args.event_time.as_deref(),
                    session_date.midnight().assume_utc(),
                )?,
                membership: args.membership,
                medium: args.medium,
                source: args.source,
                campaign: args.campaign,
                channel_group: args.channel_group,
                engaged: !args.not_engaged,
            };

            let stored = store.append_session(&input)?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
            Ok(())
        }
        SessionsCommand::List(args) => {
            let sessions = store.list_sessions_for_user(&args.user_id, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(())
        }
    }
}

fn run_attribution_command(
    command: AttributionCommand,
    store: &mut SqliteSessionStore,
) -> Result<()> {
    match command {
        AttributionCommand::Run(args) => {
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_date_arg(raw)?,
                None => now_utc().date(),
            };

            let report = if args.lookback_days.is_none() && args.gap_days.is_none() {
                store.run_attribution(as_of, args.ruleset_version)?
            } else {
                let mut ruleset = store.get_ruleset(args.ruleset_version)?;
                if let Some(lookback_days) = args.lookback_days {
                    ruleset.lookback_days = lookback_days;
                }
                if let Some(gap_days) = args.gap_days {
                    ruleset.gap_days = gap_days;
                }
                ruleset
                    .validate()
                    .map_err(|err| anyhow!("invalid run parameters: {err}"))?;
                store.run_attribution_with_ruleset(as_of, &ruleset)?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_paths(command: PathsCommand, store: &SqliteSessionStore) -> Result<()> {
    match command {
        PathsCommand::List(args) => {
            let paths = store.list_paths(args.dimension.as_deref())?;

            if args.json {
                let payload = build_path_summary_json_payload(args.dimension.as_deref(), &paths);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_paths_table(&paths);
            }
            Ok(())
        }
    }
}

fn run_runs(command: RunsCommand, store: &SqliteSessionStore) -> Result<()> {
    match command {
        RunsCommand::Show(args) => {
            let Some(report) = store.latest_run()? else {
                return Err(anyhow!("no attribution runs recorded"));
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_run_report(&report);
            }
            Ok(())
        }
    }
}

fn run_rulesets(command: RulesetsCommand, store: &SqliteSessionStore) -> Result<()> {
    match command {
        RulesetsCommand::Show(args) => {
            let ruleset = store.get_ruleset(args.ruleset_version)?;
            println!("{}", serde_json::to_string_pretty(&ruleset)?);
            Ok(())
        }
    }
}

fn parse_date_arg(raw: &str) -> Result<Date> {
    parse_date(raw).map_err(|err| anyhow!("invalid date (expected YYYY-MM-DD): {err}"))
}

fn parse_optional_utc(raw: Option<&str>, fallback: OffsetDateTime) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(fallback),
    }
}

fn parse_session_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid session id ULID: {raw}"))
}

fn print_paths_table(paths: &[PathRecord]) {
    println!(
        "{:<16} {:<56} {:>12} {:>16}",
        "dimension", "path", "conversions", "non_conversions"
    );
    println!("{}", "-".repeat(104));
    for record in paths {
        println!(
            "{:<16} {:<56} {:>12} {:>16}",
            record.dimension, record.path, record.conversion_count, record.non_conversion_count
        );
    }
}

fn print_run_report(report: &AttributionRunReport) {
    println!(
        "contract={} run_id={} ruleset={} window={}..{} lookback_days={} gap_days={}",
        report.contract_version,
        report.run_id,
        report.ruleset_version,
        report.window_start,
        report.window_end,
        report.lookback_days,
        report.gap_days
    );
    println!(
        "users={} sessions={} dropped_records={} distinct_paths={} computed_at={}",
        report.user_count,
        report.session_count,
        report.dropped_records,
        report.distinct_paths,
        report.computed_at
    );
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct PathSummaryJsonPayload {
    contract_version: String,
    dimension: Option<String>,
    paths: Vec<PathRecord>,
}

fn build_path_summary_json_payload(
    dimension: Option<&str>,
    paths: &[PathRecord],
) -> PathSummaryJsonPayload {
    PathSummaryJsonPayload {
        contract_version: "path_summary.v1".to_string(),
        dimension: dimension.map(str::to_string),
        paths: paths.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use serde_json::json;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_date_arg_accepts_iso_dates() {
        let date = must(parse_date_arg("2026-03-05"));
        assert_eq!(date.to_string(), "2026-03-05");
    }

    #[test]
    fn parse_date_arg_rejects_other_formats() {
        assert!(parse_date_arg("03/05/2026").is_err());
        assert!(parse_date_arg("2026-3-5").is_err());
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        let fallback = now_utc();
        let value = parse_optional_utc(Some("2026-03-05T12:00:00+02:00"), fallback);
        assert!(value.is_err());
    }

    #[test]
    fn path_summary_json_contract_is_stable_v1() {
        let records = vec![PathRecord {
            dimension: "medium".to_string(),
            path: "email > direct".to_string(),
            conversion_count: 3,
            non_conversion_count: 1,
        }];

        let payload = build_path_summary_json_payload(Some("medium"), &records);
        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "path_summary.v1",
                "dimension": "medium",
                "paths": [
                    {
                        "dimension": "medium",
                        "path": "email > direct",
                        "conversion_count": 3,
                        "non_conversion_count": 1
                    }
                ]
            })
        );
    }

    #[test]
    fn stable_embed_api_host_path_stays_operational() {
        let db_path =
            std::env::temp_dir().join(format!("journeypath-embed-host-{}.sqlite3", Ulid::new()));

        must(run_command_with_db(
            &db_path,
            JourneyCommand::Sessions {
                command: Box::new(SessionsCommand::Log(LogArgs {
                    user_id: "u1".to_string(),
                    session_date: "2026-03-01".to_string(),
                    event_time: Some("2026-03-01T12:00:00Z".to_string()),
                    session_id: None,
                    membership: false,
                    medium: Some("email".to_string()),
                    source: None,
                    campaign: None,
                    channel_group: None,
                    not_engaged: false,
                })),
            },
        ));

        must(run_command_with_db(
            &db_path,
            JourneyCommand::Attribution {
                command: Box::new(AttributionCommand::Run(AttributionRunArgs {
                    as_of: Some("2026-03-02".to_string()),
                    ruleset_version: 1,
                    lookback_days: None,
                    gap_days: None,
                })),
            },
        ));

        must(run_command_with_db(
            &db_path,
            JourneyCommand::Attribution {
                command: Box::new(AttributionCommand::Run(AttributionRunArgs {
                    as_of: Some("2026-03-02".to_string()),
                    ruleset_version: 1,
                    lookback_days: Some(30),
                    gap_days: Some(7),
                })),
            },
        ));

        let mut store = must(SqliteSessionStore::open(&db_path));
        must(store.migrate());
        must(run_command(
            JourneyCommand::Paths {
                command: Box::new(PathsCommand::List(PathsListArgs {
                    dimension: Some("medium".to_string()),
                    json: true,
                })),
            },
            &mut store,
        ));

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_log_run_and_inspect() {
        let db_path =
            std::env::temp_dir().join(format!("journeypath-cli-e2e-{}.sqlite3", Ulid::new()));
        let db_path_str = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };

        must(execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "sessions".to_string(),
            "log".to_string(),
            "--user-id".to_string(),
            "u1".to_string(),
            "--session-date".to_string(),
            "2026-03-01".to_string(),
            "--medium".to_string(),
            "email".to_string(),
        ]));
        must(execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "sessions".to_string(),
            "log".to_string(),
            "--user-id".to_string(),
            "u1".to_string(),
            "--session-date".to_string(),
            "2026-03-03".to_string(),
            "--membership".to_string(),
            "--medium".to_string(),
            "direct".to_string(),
        ]));

        let show_before_run = execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "runs".to_string(),
            "show".to_string(),
            "--json".to_string(),
        ]);
        assert!(show_before_run.is_err());

        must(execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "attribution".to_string(),
            "run".to_string(),
            "--as-of".to_string(),
            "2026-03-05".to_string(),
        ]));

        must(execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "paths".to_string(),
            "list".to_string(),
            "--dimension".to_string(),
            "medium".to_string(),
            "--json".to_string(),
        ]));
        must(execute_cli(vec![
            "jp".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "runs".to_string(),
            "show".to_string(),
            "--json".to_string(),
        ]));

        let store = must(SqliteSessionStore::open(&db_path));
        must(store.migrate());
        let paths = must(store.list_paths(Some("medium")));
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path, "email > direct");
        assert_eq!(paths[0].conversion_count, 1);

        let sessions = must(store.list_sessions_for_user("u1", None));
        assert_eq!(sessions.len(), 2);

        let _ = fs::remove_file(&db_path);
    }
}
