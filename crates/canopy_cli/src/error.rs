//! CLI error types.

use std::path::PathBuf;

/// Errors raised by the command implementations themselves.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// A command that needs `--path` was run without it.
    #[error("repository path required for {0}")]
    PathRequired(&'static str),

    /// No snapshot file at the given path.
    #[error("no repository found at {0:?}")]
    NoRepository(PathBuf),

    /// Unknown `--workload` name.
    #[error("unknown workload: {0} (expected counter or children)")]
    UnknownWorkload(String),
}
