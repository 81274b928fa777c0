//! tailglot: game chat log tailer with glossary matching and translation dispatch.
//! Library root: tracing setup, component wiring, glossary hot reload, shutdown.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod history;
pub mod metrics;
pub mod scheduler;
pub mod state_machine;
pub mod translate;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use capture::{tailer, Origin};
use config::{AppConfig, ConfigError, LogFormat, SettingsConfig, API_KEY_ENV};
use dispatch::MessageDispatcher;
use display::{ConsoleSink, DisplaySink, MultiSink};
use history::{HistorySink, HistoryStore};
use metrics::MetricsRegistry;
use scheduler::{DispatchContext, DispatchJob, DispatchQueue};
use translate::cache::{CacheError, TranslationCache, TranslationStore};
use translate::detect::WhatlangDetector;
use translate::glossary::GlossaryEngine;
use translate::openai::OpenAiTranslator;
use translate::TranslateError;

/// Editors often save in several writes; coalesce them before recompiling.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Fatal errors before the pipeline is running.
#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    Cache(CacheError),
    Translator(TranslateError),
    History(rusqlite::Error),
    Io(std::io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Cache(e) => write!(f, "{e}"),
            StartupError::Translator(e) => write!(f, "translator setup failed: {e}"),
            StartupError::History(e) => write!(f, "history database error: {e}"),
            StartupError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}

impl From<CacheError> for StartupError {
    fn from(e: CacheError) -> Self {
        StartupError::Cache(e)
    }
}

impl From<TranslateError> for StartupError {
    fn from(e: TranslateError) -> Self {
        StartupError::Translator(e)
    }
}

impl From<rusqlite::Error> for StartupError {
    fn from(e: rusqlite::Error) -> Self {
        StartupError::History(e)
    }
}

impl From<std::io::Error> for StartupError {
    fn from(e: std::io::Error) -> Self {
        StartupError::Io(e)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the config's debug flag.
/// Logs go to stderr so they never interleave with console display lines.
pub fn init_tracing(settings: &SettingsConfig) {
    let default = if settings.debug { "tailglot=debug" } else { "tailglot=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);
    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Runtime options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Dispatch stdin lines as clipboard-origin messages.
    pub stdin: bool,
}

/// Build the pipeline, run until Ctrl-C, then shut down in order.
pub async fn run(config: AppConfig, options: RunOptions) -> Result<(), StartupError> {
    info!(config = %options.config_path.display(), "tailglot starting");

    let glossary = Arc::new(GlossaryEngine::new(&config.glossary));

    let cache: Arc<TranslationCache> = Arc::new(if config.cache.path.trim().is_empty() {
        warn!("cache.path is empty, translations will not persist");
        TranslationCache::in_memory(config.cache.memory_capacity)?
    } else {
        TranslationCache::open(Path::new(config.cache.path.trim()), config.cache.memory_capacity)?
    });

    if config.translation.api_key.is_empty() {
        warn!(
            env = API_KEY_ENV,
            "no API key configured, translation requests will be rejected"
        );
    }
    let translator = Arc::new(OpenAiTranslator::new(config.openai_config())?);

    let dispatcher = Arc::new(MessageDispatcher::new(
        Arc::clone(&glossary),
        cache.clone(),
        translator,
        Arc::new(WhatlangDetector),
        config.dispatch_settings(),
    ));

    let mut sinks = MultiSink::new();
    if config.display.console {
        sinks.push(Arc::new(ConsoleSink::stdout()));
    }
    let history = match config.history_path() {
        Some(path) => {
            let store = HistoryStore::open(&path)?;
            sinks.push(Arc::new(HistorySink::new(Arc::clone(&store))));
            Some(store)
        }
        None => None,
    };
    if sinks.is_empty() {
        warn!("no display sink enabled, results will only appear in logs");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let ctx = Arc::new(DispatchContext {
        dispatcher,
        sink: Arc::new(sinks) as Arc<dyn DisplaySink>,
        metrics: Arc::clone(&metrics),
        retry: config.retry_policy(),
    });

    let shutdown = CancellationToken::new();
    let queue = DispatchQueue::new(config.dispatch.queue_capacity);
    let Some(rx) = queue.take_receiver() else {
        return Err(StartupError::Io(std::io::Error::other("dispatch queue already consumed")));
    };
    let dispatch_loop = tokio::spawn(scheduler::run_dispatch_loop(
        rx,
        ctx,
        config.dispatch.max_concurrency,
        shutdown.clone(),
    ));

    // log tailer on its own thread; lines flow into the bounded queue
    let parser = config.chat_parser();
    let line_tx = queue.sender();
    let tailer = tailer::spawn(config.log_source()?, config.poll_interval(), move |line| {
        if let Some(message) = parser.parse(&line, Origin::Log) {
            scheduler::submit_blocking_to(&line_tx, message);
        }
    })?;
    spawn_state_logger(tailer.subscribe(), shutdown.clone());

    let stdin_task = options
        .stdin
        .then(|| tokio::spawn(read_stdin(queue.sender(), config.chat_parser(), shutdown.clone())));

    // keep the watcher alive until shutdown
    let _glossary_watcher = match watch_glossary(&options.config_path, Arc::clone(&glossary), shutdown.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, path = %options.config_path.display(), "glossary hot reload disabled");
            None
        }
    };

    info!(
        monitor_mode = %config.capture.monitor_mode,
        max_concurrency = config.dispatch.max_concurrency,
        stdin = options.stdin,
        "pipeline running, press Ctrl-C to stop"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown requested");

    shutdown.cancel();
    // joining the tailer thread closes its file and watcher
    if let Err(e) = tokio::task::spawn_blocking(move || tailer.stop()).await {
        error!(error = %e, "tailer stop task failed");
    }
    if let Some(task) = stdin_task {
        if let Err(e) = task.await {
            error!(error = %e, "stdin reader failed");
        }
    }
    drop(queue);
    if let Err(e) = dispatch_loop.await {
        error!(error = %e, "dispatch loop failed");
    }

    if let Err(e) = cache.flush() {
        warn!(error = %e, "cache flush failed");
    }
    if let Some(store) = history {
        store.close().await;
    }
    metrics.log_summary();
    info!("tailglot stopped");
    Ok(())
}

/// Each stdin line becomes a clipboard-origin message.
async fn read_stdin(
    tx: mpsc::Sender<DispatchJob>,
    parser: capture::chat_line::ChatLineParser,
    shutdown: CancellationToken,
) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(message) = parser.parse(&line, Origin::Clipboard) {
                    if !scheduler::submit_to(&tx, message).await {
                        break;
                    }
                }
            }
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

fn spawn_state_logger(
    mut rx: tokio::sync::watch::Receiver<state_machine::TailerState>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *rx.borrow_and_update();
                    debug!(%state, "tailer state changed");
                }
            }
        }
    });
}

/// Recompile the glossary whenever the config file changes.
/// The parent directory is watched since editors often replace the file.
pub fn watch_glossary(
    config_path: &Path,
    engine: Arc<GlossaryEngine>,
    shutdown: CancellationToken,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    use notify::Watcher;

    let config_path = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let file_name = config_path.file_name().map(|n| n.to_os_string());
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "config watch error");
                return;
            }
        };
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return;
        }
        let touches_config = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| Some(n.to_os_string()) == file_name).unwrap_or(false));
        if touches_config {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(&dir, notify::RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            match AppConfig::load_glossary(&config_path) {
                Ok(entries) => engine.reload(&entries),
                Err(e) => warn!(error = %e, "glossary reload failed, keeping previous rules"),
            }
        }
    });

    info!(dir = %dir.display(), "watching config for glossary changes");
    Ok(watcher)
}
