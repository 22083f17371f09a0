pub mod agent_core;
pub mod config;
pub mod inference;
pub mod server;
pub mod stream;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use agent_core::{ConnectionRegistry, MemoryStore, QueryOrchestrator};
use config::{expand_tilde, OrchestratorConfig};

/// Env var selecting JSON log output (`json`); anything else is human-readable.
pub const LOG_FORMAT_ENV_VAR: &str = "QUERY_ORCHESTRATOR_LOG_FORMAT";

/// Log files kept after rotation.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for the orchestrator.
///
/// - macOS: `~/Library/Application Support/query-orchestrator/`
/// - Windows: `{FOLDERID_RoamingAppData}\query-orchestrator\`
/// - Linux: `$XDG_DATA_HOME/query-orchestrator/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.query-orchestrator/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("query-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".query-orchestrator")
}

/// Initialize the tracing subscriber — stderr plus a log file in the data dir.
///
/// On each startup:
/// 1. Rotates existing logs (orchestrator.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh orchestrator.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
///
/// A log file that cannot be opened degrades to stderr only.
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("orchestrator.log");

    // Rotate: orchestrator.log.2 → .3, .1 → .2, orchestrator.log → .1
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok()
        .map(FlushingWriter::new);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("query_orchestrator=info,tower_http=info,warn"));
    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (stderr_layer, file_layer) = if json {
        (
            fmt::layer().json().with_writer(std::io::stderr).boxed(),
            log_file.map(|w| fmt::layer().json().with_writer(w).with_ansi(false).boxed()),
        )
    } else {
        (
            fmt::layer().with_writer(std::io::stderr).with_target(true).boxed(),
            log_file.map(|w| {
                fmt::layer()
                    .with_writer(w)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(false)
                    .boxed()
            }),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    // Startup banner — makes it easy to find the right log file
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Query Orchestrator starting ==="
    );
}

/// Rotate log files: `orchestrator.log` → `orchestrator.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the path for the memory SQLite database.
///
/// Uses `memory.db_path` when set, else the platform data directory.
fn resolve_memory_db_path(config: &OrchestratorConfig) -> PathBuf {
    match config.memory.db_path {
        Some(ref path) => PathBuf::from(expand_tilde(path)),
        None => data_dir().join("memory.db"),
    }
}

/// Open the memory store. Failure disables memory instead of aborting startup.
fn open_memory(config: &OrchestratorConfig) -> Option<Arc<MemoryStore>> {
    if !config.memory.enabled {
        tracing::info!("memory disabled by config");
        return None;
    }
    let path = resolve_memory_db_path(config);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match MemoryStore::open(&path.to_string_lossy(), &config.memory) {
        Ok(store) => {
            tracing::info!(db_path = %path.display(), "memory store initialized");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(db_path = %path.display(), error = %e, "memory store unavailable, continuing without memory");
            None
        }
    }
}

/// Build the orchestrator from a loaded config.
pub fn build_orchestrator(config: OrchestratorConfig) -> anyhow::Result<QueryOrchestrator> {
    let connections =
        ConnectionRegistry::from_config(&config).context("failed to open SQL connections")?;
    let memory = open_memory(&config);
    QueryOrchestrator::from_config(config, connections, memory)
        .context("failed to build provider adapters")
}

/// Process entry point: tracing, config, orchestrator, HTTP server.
pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing FIRST — before any tracing::info!() calls
    init_tracing();

    let config = config::load_or_default().context("failed to load configuration")?;
    let bind = config.server.bind.clone();

    let orchestrator = Arc::new(build_orchestrator(config)?);
    server::serve(server::AppState::new(orchestrator), &bind).await
}
