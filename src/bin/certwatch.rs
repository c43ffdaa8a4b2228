use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

use certwatch::{FilesystemState, Notifier};
use certwatch_monitor::{Config, WatchList};

const DEFAULT_LOG_LIST: &str = "https://www.gstatic.com/ct/log_list/v3/log_list.json";

#[derive(Parser, Debug)]
#[command(name = "certwatch", version, about = "Certificate Transparency log monitor")]
struct Args {
    /// File path or URL of the JSON list of logs to monitor
    #[arg(long = "logs", default_value = DEFAULT_LOG_LIST)]
    logs: String,

    /// Directory for storing log positions and discovered certificates
    #[arg(long = "state-dir", env = "CERTWATCH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// File containing DNS names to watch, or `-` for standard input
    #[arg(long = "watchlist")]
    watchlist: Option<PathBuf>,

    /// Max number of entries to request per get-entries call
    #[arg(long = "batch-size", default_value_t = 1000)]
    batch_size: u64,

    /// Seconds between polls of each log
    #[arg(long = "poll", default_value_t = 300)]
    poll: u64,

    /// How frequently to perform a health check, in seconds
    #[arg(long = "healthcheck", default_value_t = 24 * 60 * 60)]
    healthcheck: u64,

    /// Start monitoring logs from the end rather than the beginning
    /// (saves considerable bandwidth)
    #[arg(long = "start-at-end")]
    start_at_end: bool,

    /// Do not save a copy of matching certificates in the state
    /// directory
    #[arg(long = "no-save")]
    no_save: bool,

    /// Email address to contact when a matching certificate is
    /// discovered (repeatable)
    #[arg(long = "email")]
    email: Vec<String>,

    /// Program to execute when a matching certificate is discovered
    #[arg(long = "script")]
    script: Option<PathBuf>,

    /// Write matching certificates to stdout
    #[arg(long = "stdout")]
    stdout: bool,

    /// Write notifications to stdout as JSON lines
    #[arg(long = "json")]
    json: bool,

    /// Use verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn init_tracing(&self) {
        let level_filter = match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        let builder = tracing_subscriber::fmt()
            .with_max_level(level_filter)
            .with_writer(std::io::stderr);
        if self.json {
            builder.json().init();
        } else {
            builder.init();
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("unable to determine home directory")
}

fn default_state_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".certwatch"))
}

fn default_config_dir() -> Result<PathBuf> {
    match std::env::var_os("CERTWATCH_CONFIG_DIR") {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(home_dir()?.join(".certwatch")),
    }
}

async fn read_watch_list(args: &Args) -> Result<WatchList> {
    let path = match &args.watchlist {
        Some(path) => path.clone(),
        None => {
            let default = default_config_dir()?.join("watchlist");
            if !default.exists() {
                bail!(
                    "watch list not found: please create {} or specify an alternative \
                     path using --watchlist",
                    default.display(),
                );
            }
            default
        }
    };

    let text = if path.to_str() == Some("-") {
        use tokio::io::AsyncReadExt;
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("reading watch list from standard input")?;
        text
    } else {
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading watch list from {}", path.display()))?
    };

    let watch_list = WatchList::parse(&text);
    if watch_list.is_empty() {
        bail!("the watch list is empty; nothing to monitor for");
    }
    Ok(watch_list)
}

/// Reads the optional per-user email recipients file, one address per
/// line.
async fn read_email_file(path: &PathBuf) -> Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.init_tracing();
    tracing::debug!("args: {args:?}");

    let config_dir = default_config_dir()?;
    let state_dir = match &args.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };

    let watch_list = read_watch_list(&args).await?;
    tracing::info!("watching {} patterns", watch_list.len());

    let mut email = args.email.clone();
    email.extend(read_email_file(&config_dir.join("email_recipients")).await?);

    let script_dir = config_dir.join("hooks.d");
    let notifier = Notifier {
        stdout: args.stdout,
        json: args.json,
        email,
        script: args.script.clone(),
        script_dir: script_dir.exists().then_some(script_dir),
    };

    if !notifier.any_configured() {
        bail!(
            "no notification methods were specified; use --stdout, --json, --email, \
             --script, or place executable scripts in {}/hooks.d",
            config_dir.display(),
        );
    }

    let state = FilesystemState::new(&state_dir, !args.no_save, notifier);

    let mut config = Config::new(args.logs.clone(), std::sync::Arc::new(state), watch_list);
    config.batch_size = args.batch_size.max(1);
    config.poll_interval = Duration::from_secs(args.poll.max(1));
    config.health_check_interval = Duration::from_secs(args.healthcheck.max(60));
    config.start_at_end = args.start_at_end;
    config.verbose = args.verbose > 0;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    tracing::info!("monitoring logs from {}", args.logs);
    certwatch_monitor::run(config, token).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");

        tracing::info!("starting shutdown (SIGINT)");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;

        tracing::info!("starting shutdown (SIGTERM)");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
