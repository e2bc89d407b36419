use std::path::PathBuf;

use thiserror::Error;

/// Errors from reading or checking a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not valid TOML: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A value parsed but the peer loops or the replay model cannot use it.
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no home directory for per-user configuration")]
    NoHomeDir,
}
