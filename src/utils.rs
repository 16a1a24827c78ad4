//! Directory helpers following the XDG Base Directory specification
//!
//! # Directory Structure
//!
//! - Config: `~/.config/pfw/` - `config.json` service settings
//! - State: `~/.local/state/pfw/` - persisted rules (`pfw.json`), audit log
//!
//! # Example
//!
//! ```
//! use pfw::utils::{get_state_dir, ensure_dirs};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(state) = get_state_dir() {
//!     let _rules = state.join("pfw.json");
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "spr", "pfw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

/// State directory; falls back to the data directory on platforms without one.
pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| {
        pd.state_dir()
            .unwrap_or_else(|| pd.data_dir())
            .to_path_buf()
    })
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_config_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
