//! Data directory layout.
//!
//! Everything tokenflow persists lives in one directory: the SQLite
//! database and the optional `config.toml`.

use std::path::{Path, PathBuf};

pub const DATABASE_FILE: &str = "tokenflow.db";
pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `TOKENFLOW_DATA_DIR` environment variable
/// 2. `~/.tokenflow`
/// 3. `.tokenflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOKENFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".tokenflow");
    }

    PathBuf::from(".tokenflow")
}

/// Create the data directory if needed and return the database path in it.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<PathBuf, std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await?;
    Ok(data_dir.join(DATABASE_FILE))
}
