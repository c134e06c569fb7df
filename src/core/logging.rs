//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
pub fn init() {
    init_with_default("info");
}

/// Initialize with an explicit default filter (used by `--quiet`).
pub fn init_with_default(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
