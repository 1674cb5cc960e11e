use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "RESEARCH_ASSET_DIR";

/// Directory holding the SQLite database and `config.json`.
///
/// Resolution order: `RESEARCH_ASSET_DIR`, then `dev_assets/` at the workspace
/// root for debug builds, then the platform data directory.
pub fn asset_dir() -> PathBuf {
    if let Ok(dir) = env::var(ASSET_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    if cfg!(debug_assertions) {
        return PathBuf::from(PROJECT_ROOT).join("../../dev_assets");
    }

    match ProjectDirs::from("ai", "research", "research-server") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => {
            tracing::warn!("Could not resolve a platform data directory, using ./research-data");
            PathBuf::from("research-data")
        }
    }
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    asset_dir().join("research.sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_database_live_in_asset_dir() {
        let dir = asset_dir();
        assert_eq!(config_path().parent(), Some(dir.as_path()));
        assert_eq!(database_path().file_name().and_then(|n| n.to_str()), Some("research.sqlite"));
    }
}
