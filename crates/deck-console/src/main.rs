mod app;
mod ui;

use app::{App, AppEvent, Config};
use clap::Parser;
use crossterm::{
    event::EventStream,
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use deck_core::wire::TerminalSize;
use deck_storage::PrefStore;
use deck_sync::{ApiError, CycleOutcome, HttpApi, PollPolicy, PollScheduler, RemoteApi};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::fs::{self, OpenOptions};
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const PREFS_FILE: &str = "deck.sqlite3";
const STATS_REFRESH_SECS: u64 = 5;
const NOTICE_TICK_MS: u64 = 250;

/// Terminal dashboard for a fleet of remotely managed instances.
#[derive(Debug, Parser)]
#[command(name = "deck", version)]
struct Args {
    /// Control plane base URL (falls back to DECK_BASE_URL).
    #[arg(long)]
    base_url: Option<String>,
    /// Directory holding the preference database (falls back to DECK_STATE_DIR).
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Write logs to this file (falls back to DECK_LOG_FILE).
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Poll interval while nothing is changing.
    #[arg(long, default_value_t = 2000)]
    poll_ms: u64,
    /// Poll interval while an instance is in a transitional state.
    #[arg(long, default_value_t = 500)]
    fast_poll_ms: u64,
    /// Interval between log tail requests.
    #[arg(long, default_value_t = 2000)]
    log_interval_ms: u64,
    /// Terminal size used until the output panel has been measured.
    #[arg(long, default_value_t = 80)]
    cols: u16,
    #[arg(long, default_value_t = 24)]
    rows: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = load_config(Args::parse());
    init_logging(config.log_file.as_deref())?;

    let api = Arc::new(HttpApi::new(&config.base_url)?);
    let prefs = open_prefs(&config.state_dir)?;
    info!(
        event = "console_starting",
        base_url = %config.base_url,
        state_dir = %config.state_dir.display()
    );

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let (focus_tx, focus_rx) = watch::channel(false);
    let mut scheduler = PollScheduler::new(config.poll);
    let mut app = App::new(config, api.clone(), prefs, app_tx.clone(), session_tx, focus_tx);

    start_polling(&mut scheduler, api.clone(), app_tx.clone(), focus_rx.clone());
    spawn_blueprints(api.clone(), app_tx.clone());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(
        &mut terminal,
        &mut app,
        &mut scheduler,
        Channels {
            api,
            app_tx,
            app_rx,
            session_rx,
            focus_rx,
        },
    )
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    scheduler.stop();
    app.shutdown();
    info!(event = "console_stopped");
    result
}

struct Channels {
    api: Arc<HttpApi>,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    app_rx: mpsc::UnboundedReceiver<AppEvent>,
    session_rx: mpsc::UnboundedReceiver<deck_sync::SessionEvent>,
    focus_rx: watch::Receiver<bool>,
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    scheduler: &mut PollScheduler,
    mut channels: Channels,
) -> anyhow::Result<()> {
    let mut events = EventStream::new();
    let mut notice_ticker = tokio::time::interval(Duration::from_millis(NOTICE_TICK_MS));
    let mut stats_ticker = tokio::time::interval(Duration::from_secs(STATS_REFRESH_SECS));

    loop {
        if app.take_resync() {
            start_polling(
                scheduler,
                channels.api.clone(),
                channels.app_tx.clone(),
                channels.focus_rx.clone(),
            );
        }
        let area = terminal.size()?;
        app.sync_tool_size(ui::terminal_size(area, app.splits()));
        terminal.draw(|frame| ui::render(frame, &*app))?;

        tokio::select! {
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        if app.handle_event(event) {
                            break;
                        }
                    }
                    Some(Err(err)) => warn!(event = "terminal_event_failed", error = %err),
                    None => break,
                }
            }
            Some(event) = channels.app_rx.recv() => {
                app.apply_event(event);
            }
            Some(event) = channels.session_rx.recv() => {
                app.on_session_event(event);
            }
            _ = notice_ticker.tick() => {
                app.prune_notices();
            }
            _ = stats_ticker.tick() => {
                spawn_stats(channels.api.clone(), channels.app_tx.clone());
            }
        }
    }
    Ok(())
}

/// (Re)starts the poll loop. A restart drops any pending delay so the next
/// snapshot is fetched immediately.
fn start_polling(
    scheduler: &mut PollScheduler,
    api: Arc<HttpApi>,
    tx: mpsc::UnboundedSender<AppEvent>,
    focus: watch::Receiver<bool>,
) {
    scheduler.start(move || {
        let api = api.clone();
        let tx = tx.clone();
        let focus = focus.clone();
        async move { poll_cycle(api.as_ref(), &tx, &focus).await }
    });
}

async fn poll_cycle(
    api: &dyn RemoteApi,
    tx: &mpsc::UnboundedSender<AppEvent>,
    focus: &watch::Receiver<bool>,
) -> Result<CycleOutcome, ApiError> {
    let focused = *focus.borrow();
    if focused {
        return Ok(CycleOutcome::Skipped);
    }
    let records = match api.list_instances().await {
        Ok(records) => records,
        Err(err) => {
            let _ = tx.send(AppEvent::FetchFailed(err.reason()));
            return Err(err);
        }
    };
    let (ack, outcome) = oneshot::channel();
    if tx.send(AppEvent::Snapshot { records, ack }).is_err() {
        return Ok(CycleOutcome::Detached);
    }
    Ok(outcome.await.unwrap_or(CycleOutcome::Detached))
}

fn spawn_stats(api: Arc<HttpApi>, tx: mpsc::UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        match api.system_stats().await {
            Ok(stats) => {
                let _ = tx.send(AppEvent::Stats(stats));
            }
            Err(err) => warn!(event = "stats_fetch_failed", error = %err),
        }
    });
}

fn spawn_blueprints(api: Arc<HttpApi>, tx: mpsc::UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        match api.list_blueprints().await {
            Ok(blueprints) => {
                let _ = tx.send(AppEvent::Blueprints(blueprints));
            }
            Err(err) => warn!(event = "blueprints_fetch_failed", error = %err),
        }
    });
}

fn load_config(args: Args) -> Config {
    Config {
        base_url: args.base_url.unwrap_or_else(resolve_base_url),
        state_dir: args.state_dir.unwrap_or_else(resolve_state_dir),
        log_file: args.log_file.or_else(resolve_log_file),
        poll: PollPolicy::new(
            Duration::from_millis(args.poll_ms),
            Duration::from_millis(args.fast_poll_ms),
        ),
        log_interval: Duration::from_millis(args.log_interval_ms),
        fallback_size: TerminalSize {
            cols: args.cols.max(1),
            rows: args.rows.max(1),
        },
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_base_url() -> String {
    non_empty_env("DECK_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn resolve_state_dir() -> PathBuf {
    if let Some(value) = non_empty_env("DECK_STATE_DIR") {
        return PathBuf::from(value);
    }
    if let Some(value) = non_empty_env("XDG_STATE_HOME") {
        return PathBuf::from(value).join("deck");
    }
    match non_empty_env("HOME") {
        Some(home) => PathBuf::from(home).join(".local/state/deck"),
        None => PathBuf::from(".deck"),
    }
}

fn resolve_log_file() -> Option<PathBuf> {
    non_empty_env("DECK_LOG_FILE").map(PathBuf::from)
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init();
        return Ok(());
    }
    let stdout_enabled = std::env::var("DECK_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
    Ok(())
}

fn open_prefs(dir: &Path) -> anyhow::Result<PrefStore> {
    fs::create_dir_all(dir)?;
    Ok(PrefStore::open(dir.join(PREFS_FILE))?)
}
