use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors from running network commands.
#[derive(Debug, Error)]
pub enum Error {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: &'static str,
        /// Spawn failure.
        #[source]
        source: io::Error,
    },

    /// The program ran and reported failure.
    #[error("{command} exited with {code:?}: {stderr}")]
    Exit {
        /// The full command line.
        command: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// What the program printed on stderr.
        stderr: String,
    },

    /// The program did not finish in time and was killed.
    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        /// The full command line.
        command: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The command serializer is gone.
    #[error(transparent)]
    Serializer(#[from] vipd_serializer::Error),
}

impl Error {
    /// Whether the failure says the address is already configured.
    #[must_use]
    pub fn is_already_present(&self) -> bool {
        matches!(self, Self::Exit { stderr, .. } if stderr.contains("File exists"))
    }

    /// Whether the failure says the address was not configured.
    #[must_use]
    pub fn is_already_absent(&self) -> bool {
        matches!(self, Self::Exit { stderr, .. } if stderr.contains("Cannot assign requested address"))
    }
}
