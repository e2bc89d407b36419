//! Layered loading: defaults, then files, then the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

use crate::{JasperConfig, Paths};

/// Builds a [`JasperConfig`] from every source that applies to one project.
///
/// Later sources win:
///
/// | source | example |
/// |---|---|
/// | built-in defaults | [`JasperConfig::default`] |
/// | per-user file | `~/.config/jasper/config.toml` |
/// | project file | `jasper.toml` |
/// | local override | `jasper.local.toml` |
/// | environment | `JASPER_REPLAY__CEILING=50` |
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// A loader rooted at the working directory.
    pub fn new() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "JASPER".to_string(),
            user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignores the per-user file. Tests use this to stay hermetic.
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Existing files that will be layered over the defaults, lowest
    /// precedence first.
    pub fn files(&self) -> Vec<PathBuf> {
        let user = if self.user_config {
            Paths::new().user_config_file().ok()
        } else {
            None
        };
        user.into_iter()
            .chain(Paths::project_files(&self.project_dir))
            .filter(|path| path.is_file())
            .collect()
    }

    pub fn load(self) -> Result<JasperConfig> {
        let defaults = Config::try_from(&JasperConfig::default())
            .context("built-in defaults do not serialize")?;
        let files = self.files();
        let env = Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);

        let merged = files
            .into_iter()
            .fold(Config::builder().add_source(defaults), |builder, path| {
                builder.add_source(File::from(path).format(FileFormat::Toml))
            })
            .add_source(env)
            .build()
            .context("cannot merge configuration sources")?;

        let mut loaded: JasperConfig = merged
            .try_deserialize()
            .context("merged configuration has the wrong shape")?;
        loaded.validate().context("rejected configuration")?;
        loaded.resolve_paths(&self.project_dir);
        Ok(loaded)
    }

    /// Like [`load`](Self::load), falling back to the defaults on any error.
    pub fn load_or_default(self) -> JasperConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
