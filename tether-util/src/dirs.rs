use std::path::PathBuf;

/// Return the application configuration directory
pub fn config_dir() -> PathBuf {
    let dir = if let Some(config_dir) = dirs::config_dir() {
        config_dir
    } else {
        // Fallback to home directory if config dir is not available
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    };
    dir.join(env!("TETHER_PKG_NAME"))
}

/// Return the application cache directory
///
/// The target state poller keeps its ETag cache here.
pub fn cache_dir() -> PathBuf {
    let dir = if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cache")
    };
    dir.join(env!("TETHER_PKG_NAME"))
}
