use tracing_subscriber::EnvFilter;

/// Filter override, e.g. `DROIDGLASS_LOG=droidglass=debug`.
const LOG_ENV: &str = "DROIDGLASS_LOG";

/// Logs go to stderr; stdout belongs to whatever embeds the engine. Debug
/// builds get human-readable lines, release builds structured JSON.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}
