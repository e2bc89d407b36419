//! Where configuration files are looked up.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::ConfigError;

/// Checked-in project configuration.
pub const PROJECT_FILE: &str = "jasper.toml";

/// Uncommitted overrides next to [`PROJECT_FILE`].
pub const LOCAL_FILE: &str = "jasper.local.toml";

/// Locates the per-user and per-project configuration files.
#[derive(Debug, Clone)]
pub struct Paths {
    dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            dirs: ProjectDirs::from("dev", "Jasper", "jasper"),
        }
    }

    /// `config.toml` in the platform config directory, `~/.config/jasper/`
    /// on Linux. Fails when the platform has no home directory.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        let dirs = self.dirs.as_ref().ok_or(ConfigError::NoHomeDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// The project file and its local override, lowest precedence first.
    pub fn project_files(project_dir: &Path) -> [PathBuf; 2] {
        [project_dir.join(PROJECT_FILE), project_dir.join(LOCAL_FILE)]
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_file_is_named_after_the_application() {
        // No home directory in some sandboxes.
        if let Ok(file) = Paths::new().user_config_file() {
            assert!(file.ends_with("config.toml"));
            assert!(file.to_string_lossy().contains("jasper"));
        }
    }

    #[test]
    fn local_file_overrides_project_file() {
        let [project, local] = Paths::project_files(Path::new("/srv/cluster"));
        assert_eq!(project, PathBuf::from("/srv/cluster/jasper.toml"));
        assert_eq!(local, PathBuf::from("/srv/cluster/jasper.local.toml"));
    }
}
