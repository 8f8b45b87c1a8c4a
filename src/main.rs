use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio_util::sync::CancellationToken;

use forex_rate_collector::{
    banks::resolve_sources,
    collector::session::{self, WebDriverProvider},
    config::Config,
    display,
    history::HistoryStore,
    metrics::METRICS,
    orchestrator::{Orchestrator, Persisted, Schedule},
    util,
};

#[derive(Parser)]
#[command(name = "forex-rate-collector")]
#[command(about = "Collects USD TT buy rates from bank websites into a rolling history", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Disable the live status table
    #[arg(long)]
    no_live: bool,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// One run per invocation:
// - Load configuration and resolve sources
// - Run the stateful then the stateless phase
// - Merge the batch into history
// - Print the summary
//
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // rustls >= 0.23 needs an explicit provider before any TLS client
    // is built. An already-installed provider is fine.
    let _ = CryptoProvider::install_default(ring::default_provider());

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_logging("info");
            error!("{e:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    init_logging(&config.log_level);

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<ExitCode> {
    let sources = resolve_sources(&config);
    if sources.is_empty() {
        warn!("no enabled sources configured");
    }
    info!(
        "collecting from {} sources: {}",
        sources.len(),
        sources.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
    );

    let http = util::build_http_client(&config.http).context("building HTTP client")?;
    let sessions = WebDriverProvider::new(config.webdriver.clone())
        .context("building WebDriver client")?;
    let store = HistoryStore::from_config(&config.history);

    let orchestrator = Orchestrator::new(sources, Schedule::from(&config.schedule), http, sessions);

    // --------------------------------------------------------
    // Interrupt handling: SIGINT / SIGTERM cancel the run
    // --------------------------------------------------------
    let cancel = CancellationToken::new();
    tokio::spawn(forward_signals(cancel.clone()));

    let view_stop = CancellationToken::new();
    let view = (!cli.no_live)
        .then(|| display::spawn_live_view(orchestrator.board(), view_stop.clone()));

    let report = orchestrator.run(&store, &cancel).await;

    view_stop.cancel();
    if let Some(view) = view {
        let _ = view.await;
    }

    if !session::finish_teardowns(TEARDOWN_GRACE).await {
        warn!("some rendering sessions were still shutting down at exit");
    }

    println!("{}", display::render_summary(&report));
    info!("[METRICS] {}", METRICS.summary());

    let code = match &report.persisted {
        Persisted::Written(_) | Persisted::NoData => ExitCode::SUCCESS,
        Persisted::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        Persisted::Failed(_) => ExitCode::from(EXIT_FAILURE),
    };
    Ok(code)
}

fn init_logging(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}

async fn forward_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
                warn!("interrupt received, shutting down");
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("interrupt received, shutting down");
    cancel.cancel();
}
