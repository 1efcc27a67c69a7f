//! Centralized path utilities
//!
//! All runtime paths in one place for consistency

use std::path::{Path, PathBuf};

/// Name of the per-user and per-project configuration directory
pub const CONFIG_DIR_NAME: &str = ".skillet";

/// Get the skillet config directory (~/.skillet)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the runtime config file (~/.skillet/config.toml)
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the user skills directory (~/.skillet/skills)
pub fn skills_dir() -> PathBuf {
    config_dir().join("skills")
}

/// Get the approvals file (~/.skillet/approvals.json)
pub fn approvals_path() -> PathBuf {
    config_dir().join("approvals.json")
}

/// Project-local skills (<root>/.skillet/skills)
pub fn project_skills_dir(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR_NAME).join("skills")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_hang_off_config_dir() {
        let base = config_dir();
        assert!(base.ends_with(CONFIG_DIR_NAME));
        assert_eq!(skills_dir(), base.join("skills"));
        assert_eq!(approvals_path().parent(), Some(base.as_path()));
        assert_eq!(
            project_skills_dir(Path::new("/work/repo")),
            PathBuf::from("/work/repo/.skillet/skills")
        );
    }
}
