//! Error types for SSH sessions and the ephemeral key lifecycle.

use thiserror::Error;

use runner_core::db::DatabaseError;

/// Errors from the SSH client and key manager.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to connect to {host}: {source}")]
    Connect { host: String, source: russh::Error },

    #[error("connection to {host} timed out")]
    DialTimeout { host: String },

    #[error("authentication failed for {user}@{host}")]
    Auth { host: String, user: String },

    #[error("host key mismatch for {host}")]
    HostKeyMismatch { host: String },

    #[error("no host key retrieved for {host}")]
    NoHostKey { host: String },

    #[error("host {0} has no key_path configured")]
    MissingKeyPath(String),

    #[error("command failed on {host} (exit {code}): {stderr}")]
    CommandFailed {
        host: String,
        code: u32,
        stderr: String,
    },

    #[error("channel closed before exit status on {host}")]
    NoExitStatus { host: String },

    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("key error: {0}")]
    Key(String),

    #[error("timed out waiting for SSH readiness on: {0}")]
    ReadinessTimeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
