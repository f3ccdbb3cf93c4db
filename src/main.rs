use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use culprit_finder::bisect::ResumeChoice;
use culprit_finder::config::Config;
use culprit_finder::github::{self, GithubClient, RunUrl};
use culprit_finder::report::{self, Report};
use culprit_finder::storage::{CacheMode, ResultCache, SessionStore, SqliteStore, WorkflowKey};
use culprit_finder::tester::WorkflowTester;
use culprit_finder::BisectRequest;

#[derive(Parser)]
#[command(
    name = "culprit-finder",
    about = "Find the commit that broke a GitHub Actions workflow",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $CULPRIT_FINDER_CONFIG, then ~/.config/culprit-finder/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State database (overrides [storage] db_path)
    #[arg(long, global = true, env = "CULPRIT_FINDER_DB")]
    db: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bisect a commit range to find the first failing commit
    Bisect(BisectArgs),

    /// Inspect or clear cached verdicts
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect, discard or unlock a saved bisection
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Args)]
struct BisectArgs {
    /// Target repository (owner/repo)
    #[arg(short, long, required_unless_present = "url")]
    repo: Option<String>,

    /// Last known good commit or ref
    #[arg(short, long, required_unless_present = "url")]
    start: Option<String>,

    /// First known bad commit or ref
    #[arg(short, long, required_unless_present = "url")]
    end: Option<String>,

    /// Workflow file name (e.g. build_and_test.yml)
    #[arg(short, long, required_unless_present = "url")]
    workflow: Option<String>,

    /// Judge a single job instead of the whole run
    #[arg(short, long)]
    job: Option<String>,

    /// Failed run or job URL; the previous successful run becomes the good boundary
    #[arg(long, conflicts_with_all = ["repo", "start", "end", "workflow", "job"])]
    url: Option<String>,

    /// Ignore cached verdicts (results are still recorded)
    #[arg(long)]
    no_cache: bool,

    /// Drop cached verdicts for this workflow/job before starting
    #[arg(long)]
    clear_cache: bool,

    /// Reopen an abandoned session
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Discard any saved session and start over
    #[arg(long)]
    fresh: bool,

    /// Take over the session lock even if another process holds it
    #[arg(long)]
    force_unlock: bool,

    /// Dispatch the target workflow directly even if a wrapper workflow exists
    #[arg(long)]
    no_wrapper: bool,

    /// Write a JSON report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct TargetArgs {
    /// Target repository (owner/repo)
    #[arg(short, long)]
    repo: String,

    /// Workflow file name
    #[arg(short, long)]
    workflow: String,

    /// Job name
    #[arg(short, long)]
    job: Option<String>,
}

impl TargetArgs {
    fn key(&self) -> Result<WorkflowKey> {
        github::validate_repository(&self.repo)?;
        Ok(WorkflowKey::new(&self.repo, &self.workflow, self.job.clone()))
    }
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached verdicts (every job unless --job is given)
    List(TargetArgs),

    /// Remove cached verdicts (every job unless --job is given)
    Clear(TargetArgs),
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show the saved session
    Show(TargetArgs),

    /// Delete the saved session
    Clear(TargetArgs),

    /// Remove a leftover session lock
    Unlock(TargetArgs),
}

fn init_tracing(level: &str, verbose: u8, json: bool) {
    let level = match verbose {
        0 => level,
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    init_tracing(&config.logging.level, cli.verbose, cli.log_json || config.logging.json);

    match cli.command {
        Commands::Bisect(args) => bisect(args, config).await,
        Commands::Cache { action } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let cache = ResultCache::new(store);
            match action {
                CacheAction::List(target) => {
                    target.key()?;
                    let entries = cache.entries(&target.repo, &target.workflow, target.job.as_deref())?;
                    print!("{}", report::format_cache_entries(&entries));
                    if !entries.is_empty() {
                        println!("{} cached verdict(s)", entries.len());
                    } else {
                        println!();
                    }
                }
                CacheAction::Clear(target) => {
                    target.key()?;
                    let removed = cache.clear(&target.repo, &target.workflow, target.job.as_deref())?;
                    println!("Removed {} cached verdict(s).", removed);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Session { action } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let sessions = SessionStore::new(store);
            match action {
                SessionAction::Show(target) => match sessions.load(&target.key()?)? {
                    Some(state) => {
                        print!("{}", report::format_session(&state));
                        if let Some(holder) = sessions.lock_holder(&target.key()?)? {
                            println!("{:<20} pid {} since {}", "Locked by:", holder.pid, holder.acquired_at);
                        }
                    }
                    None => println!("No saved session."),
                },
                SessionAction::Clear(target) => {
                    if sessions.clear(&target.key()?)? {
                        println!("Session cleared.");
                    } else {
                        println!("No saved session.");
                    }
                }
                SessionAction::Unlock(target) => {
                    if sessions.unlock(&target.key()?)? {
                        println!("Lock removed.");
                    } else {
                        println!("No lock held.");
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn bisect(args: BisectArgs, config: Config) -> Result<ExitCode> {
    let Some(token) = github::discover_token() else {
        bail!("not authenticated with GitHub: set GH_TOKEN or run `gh auth login`");
    };
    let client = GithubClient::new(&config.github.api_url, Some(token), config.github.request_timeout)?
        .with_retry(config.tester.transport);

    let (key, good, bad) = match &args.url {
        Some(url) => {
            let url: RunUrl = url.parse()?;
            let resolved = github::resolve_run_url(&client, &url).await?;
            (
                WorkflowKey::new(resolved.repository, resolved.workflow, resolved.job),
                resolved.good,
                resolved.bad,
            )
        }
        None => match (args.repo, args.start, args.end, args.workflow) {
            (Some(repo), Some(start), Some(end), Some(workflow)) => {
                github::validate_repository(&repo)?;
                (WorkflowKey::new(repo, workflow, args.job), start, end)
            }
            _ => bail!("--repo, --start, --end and --workflow are required without --url"),
        },
    };

    tracing::info!(%key, %good, %bad, "initializing culprit finder");

    let wrapper = match config.github.wrapper() {
        Some(wrapper) if !args.no_wrapper && wrapper != key.workflow => {
            let found = client
                .has_workflow(&key.repository, wrapper)
                .await
                .context("failed to look up the wrapper workflow")?;
            found.then(|| wrapper.to_string())
        }
        _ => None,
    };
    tracing::info!(wrapper = ?wrapper, "using culprit finder workflow: {}", wrapper.is_some());

    let tester = WorkflowTester::new(client.clone(), config.tester).with_wrapper_workflow(wrapper);
    let store = Arc::new(
        SqliteStore::open(&config.storage.db_path)
            .with_context(|| format!("failed to open {}", config.storage.db_path.display()))?,
    );

    let mut request = BisectRequest::new(key.clone(), good, bad);
    request.resume = if args.fresh {
        ResumeChoice::Fresh
    } else if args.resume {
        ResumeChoice::Resume
    } else {
        ResumeChoice::Auto
    };
    request.clear_cache = args.clear_cache;
    request.force_unlock = args.force_unlock;
    request.cache_mode = if args.no_cache {
        CacheMode::WriteOnly
    } else {
        CacheMode::ReadWrite
    };
    request.engine = config.engine;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after cleanup (press Ctrl-C again to exit now)");
            watcher.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let bisection = culprit_finder::run_bisection(&request, &client, Arc::new(tester), store, cancel).await?;

    println!("\n{}", report::format_summary(&bisection.outcome));
    if let Some(path) = &args.report {
        Report::new(&key, &bisection.range, &bisection.outcome).write_json(path)?;
        tracing::info!(path = %path.display(), "wrote report");
    }
    Ok(ExitCode::from(bisection.outcome.exit_code() as u8))
}
