//! Errors surfaced synchronously to the user.
//!
//! Everything else (malformed status lines, converter failures, sentinel
//! races) is absorbed where it happens and reported through events.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Invocation arguments are missing or malformed. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The session's control directory could not be prepared.
    #[error("failed to create control directory {path}: {source}")]
    Environment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The render engine could not be launched.
    #[error("failed to launch render engine {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
