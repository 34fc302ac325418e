//! kmanga: build manga issues into e-reader documents and deliver them.
//!
//! `send`, `daily` and `retry` select (issue, user) jobs from the catalog and
//! run them through the build orchestrator; `cache` maintains the issue and
//! document caches. Configuration and usage errors exit non-zero; a job that
//! fails to build or deliver is recorded as failed and doesn't.

mod error;

use crate::error::{ErrorKind, Result};
use clap::{Args, Parser, Subcommand};
use exn::ResultExt;
use futures::StreamExt;
use kmanga_catalog::{Catalog, Database, Status};
use kmanga_config::Config;
use kmanga_library::{BatchEvent, BuildSettings, Caches, Job, Orchestrator, OutboxDelivery};
use kmanga_mobi::{Kindlegen, MangaMobi};
use std::path::PathBuf;
use std::pin::pin;
use std::process::ExitCode;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time, UtcDateTime};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kmanga", version, about = "Build and deliver manga issues to e-readers")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, global = true, env = "KMANGA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug-level logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send issues to one user.
    Send(SendArgs),
    /// Send every user whose send hour it is their next issues, within quota.
    Daily(DailyArgs),
    /// Re-run failed deliveries.
    Retry(RetryArgs),
    /// Cache maintenance.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    user: String,

    /// Only send issues crawled by this spider.
    #[arg(long)]
    spider: Option<String>,

    /// Issue URLs; every unsent subscribed issue when omitted.
    urls: Vec<String>,
}

#[derive(Args, Debug)]
struct DailyArgs {
    /// Only send issues crawled by this spider.
    #[arg(long)]
    spider: Option<String>,
}

#[derive(Args, Debug)]
struct RetryArgs {
    #[arg(long)]
    user: Option<String>,

    /// Only failures last updated at or after this date (`YYYY-MM-DD` or RFC 3339).
    #[arg(long, value_parser = parse_since)]
    since: Option<UtcDateTime>,

    /// Only failures last updated at or before this date (a bare date covers the whole day).
    #[arg(long, value_parser = parse_until)]
    until: Option<UtcDateTime>,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Remove entries older than the TTL.
    Clean {
        /// TTL in seconds; defaults to the configured one.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Evict the oldest entries of caches over their slot limit.
    Free,
    /// Remove issue entries whose images were deleted.
    Purge,
    /// List cached keys, oldest first.
    Show,
}

fn parse_since(value: &str) -> std::result::Result<UtcDateTime, String> {
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(datetime) => Ok(datetime.to_utc()),
        Err(_) => parse_day(value).map(|day| UtcDateTime::new(day, Time::MIDNIGHT)),
    }
}

fn parse_until(value: &str) -> std::result::Result<UtcDateTime, String> {
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(datetime) => Ok(datetime.to_utc()),
        Err(_) => {
            let end = Time::from_hms_nano(23, 59, 59, 999_999_999).map_err(|e| e.to_string())?;
            parse_day(value).map(|day| UtcDateTime::new(day, end))
        },
    }
}

fn parse_day(value: &str) -> std::result::Result<Date, String> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|e| format!("expected YYYY-MM-DD or an RFC 3339 timestamp: {e}"))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Command failed");
            eprintln!("error: {e}");
            e.exit_code()
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    match cli.command {
        Command::Cache(command) => cache(&Caches::from_config(&config), &config, command).await,
        Command::Send(args) => {
            let orchestrator = orchestrator(&config).await?;
            let jobs = orchestrator
                .send_jobs(&args.user, &args.urls, args.spider.as_deref())
                .await
                .map_err(ErrorKind::library)?;
            process(&orchestrator, jobs).await
        },
        Command::Daily(args) => {
            let orchestrator = orchestrator(&config).await?;
            let jobs =
                orchestrator.daily_jobs(UtcDateTime::now(), args.spider.as_deref()).await.map_err(ErrorKind::library)?;
            process(&orchestrator, jobs).await
        },
        Command::Retry(args) => {
            let orchestrator = orchestrator(&config).await?;
            let jobs = orchestrator
                .retry_jobs(args.user.as_deref(), args.since, args.until)
                .await
                .map_err(ErrorKind::library)?;
            process(&orchestrator, jobs).await
        },
    }
}

async fn orchestrator(config: &Config) -> Result<Orchestrator> {
    let settings = BuildSettings::try_from(config).or_raise(|| ErrorKind::Config)?;
    let compiler = Kindlegen::resolve(config.build.kindlegen.as_deref()).or_raise(|| ErrorKind::Config)?;
    let builder = MangaMobi::new(compiler).or_raise(|| ErrorKind::Runtime)?;
    let db = Database::connect(&config.catalog.path).await.or_raise(|| ErrorKind::Runtime)?;
    let delivery = Arc::new(OutboxDelivery::new(config.delivery.outbox.clone()));
    Ok(Orchestrator::new(Catalog::from(&db), Caches::from_config(config), builder, delivery, settings))
}

async fn process(orchestrator: &Orchestrator, jobs: Vec<Job>) -> Result<()> {
    let mut events = pin!(orchestrator.batch(jobs));
    let (mut sent, mut failed) = (0u64, 0u64);
    while let Some(event) = events.next().await {
        match event.map_err(ErrorKind::library)? {
            BatchEvent::Started => tracing::debug!("Batch started"),
            BatchEvent::DiscoveryComplete(total) => tracing::info!(total, "Jobs selected"),
            BatchEvent::Processed(outcome) => {
                match outcome.status {
                    Status::Sent => sent += 1,
                    _ => failed += 1,
                }
                println!("{}\t{}\t{}", outcome.status, outcome.user, outcome.issue);
            },
            BatchEvent::Complete => tracing::info!(sent, failed, "Batch complete"),
        }
    }
    Ok(())
}

async fn cache(caches: &Caches, config: &Config, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Clean { ttl } => {
            let removed = caches.clean(ttl.unwrap_or(config.cache.ttl_seconds)).await.map_err(ErrorKind::library)?;
            println!("removed {} issue and {} document entries", removed.issues, removed.documents);
        },
        CacheCommand::Free => {
            let removed = caches.free().await.map_err(ErrorKind::library)?;
            println!("removed {} issue and {} document entries", removed.issues, removed.documents);
        },
        CacheCommand::Purge => {
            let purged = caches.issues.purge_invalid().await.or_raise(|| ErrorKind::Runtime)?;
            for key in &purged {
                println!("{key}");
            }
        },
        CacheCommand::Show => {
            let issues = caches.issues.entries().await.or_raise(|| ErrorKind::Runtime)?;
            let documents = caches.documents.entries().await.or_raise(|| ErrorKind::Runtime)?;
            for (name, entries) in [("issue", issues), ("document", documents)] {
                for (key, created_at) in entries {
                    let created_at = created_at.format(&Rfc3339).or_raise(|| ErrorKind::Runtime)?;
                    println!("{name}\t{created_at}\t{key}");
                }
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::utc_datetime;

    #[rstest]
    #[case("2024-03-01", utc_datetime!(2024-03-01 0:00))]
    #[case("2024-03-01T12:30:00+02:00", utc_datetime!(2024-03-01 10:30))]
    fn test_parse_since(#[case] input: &str, #[case] expected: UtcDateTime) {
        assert_eq!(parse_since(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_until_covers_day() {
        assert_eq!(parse_until("2024-03-01").unwrap(), utc_datetime!(2024-03-01 23:59:59.999999999));
        assert!(parse_until("yesterday").is_err());
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::parse_from(["kmanga", "send", "--user", "reader", "https://example.com/manga/1"]);
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.user, "reader");
                assert_eq!(args.urls, vec!["https://example.com/manga/1"]);
                assert!(args.spider.is_none());
            },
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_cache_clean() {
        let cli = Cli::parse_from(["kmanga", "-v", "cache", "clean", "--ttl", "60"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Cache(CacheCommand::Clean { ttl: Some(60) })));
    }

    #[test]
    fn test_parse_retry_rejects_bad_date() {
        assert!(Cli::try_parse_from(["kmanga", "retry", "--since", "soon"]).is_err());
    }

    #[rstest]
    #[case(kmanga_library::error::ErrorKind::UnknownUser("nobody".into()), ExitCode::from(2))]
    #[case(kmanga_library::error::ErrorKind::InvalidArgument("range".into()), ExitCode::from(2))]
    #[case(kmanga_library::error::ErrorKind::Catalog, ExitCode::FAILURE)]
    fn test_exit_codes(#[case] kind: kmanga_library::error::ErrorKind, #[case] expected: ExitCode) {
        let err = ErrorKind::library(exn::Exn::from(kind));
        assert_eq!(err.exit_code(), expected);
    }
}
