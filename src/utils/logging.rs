use tracing::Level;

/// Environment variable holding the log level of the binary.
pub const LOG_ENV: &str = "RELAYMQ_LOG";

/// Maps a level name to a `tracing` level. Unknown names fall back to `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Installs the fmt subscriber at `level`.
pub fn init(level: &str) {
    // try_init: tests and embedding binaries may call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init();
}

/// Installs the fmt subscriber at the level named by `RELAYMQ_LOG`, `info` when unset.
pub fn init_from_env() {
    let level = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    init(&level);
}
