//! SSH client for running installation stages on a host.
//!
//! Each [`SshClient::exec`] opens a fresh channel (SSH exec sessions are
//! single-shot) and streams stdout/stderr line-wise to the injected
//! [`OutputSink`] while the command runs.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tracing::debug;

use runner_core::config::Server;

use crate::error::SshError;
use crate::known_hosts::KnownHostKeys;

/// TCP dial + key exchange budget.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver for remote command output.
///
/// Implementations must be cheap: lines are delivered inline with channel
/// reads.
pub trait OutputSink: Send + Sync {
    fn stdout_line(&self, host: &str, line: &str);
    fn stderr_line(&self, host: &str, line: &str);
}

/// Sink that discards all remote output.
pub struct DiscardSink;

impl OutputSink for DiscardSink {
    fn stdout_line(&self, _host: &str, _line: &str) {}
    fn stderr_line(&self, _host: &str, _line: &str) {}
}

/// How to authenticate the session.
#[derive(Clone)]
pub enum SshAuth {
    /// Operator key on disk (`~` expanded).
    KeyFile(String),
    /// In-memory ephemeral key.
    Key(Arc<PrivateKey>),
}

/// Host key verification policy for a session.
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Accept whatever the server presents (operator-keyed hosts).
    AcceptAny,
    /// Accept and record the first key seen for the host.
    Record(KnownHostKeys),
    /// Require an exact match against the pinned key.
    Pinned(PublicKey),
}

pub(crate) struct ClientHandler {
    host: String,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(host: &str, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.to_string(),
            policy,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::Record(known) => {
                known.record(&self.host, server_public_key.clone());
                Ok(true)
            }
            HostKeyPolicy::Pinned(expected) => {
                Ok(expected.key_data() == server_public_key.key_data())
            }
        }
    }
}

/// Accumulates raw channel bytes and yields complete lines.
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.push_str(&String::from_utf8_lossy(data));
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            emit(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn flush(&mut self, mut emit: impl FnMut(&str)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            emit(line.trim_end_matches('\r'));
        }
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_key_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

fn load_key(path: &str) -> Result<PrivateKey, SshError> {
    let expanded = expand_key_path(path);
    russh::keys::load_secret_key(&expanded, None)
        .map_err(|e| SshError::Key(format!("unable to read private key {expanded}: {e}")))
}

/// An authenticated SSH connection to a single host.
pub struct SshClient {
    handle: client::Handle<ClientHandler>,
    host: String,
    sink: Arc<dyn OutputSink>,
}

impl SshClient {
    /// Dial `host:22`, verify the host key per `policy`, and authenticate
    /// with the given key. The dial and key exchange share a 10-second
    /// budget.
    pub async fn connect(
        server: &Server,
        auth: SshAuth,
        policy: HostKeyPolicy,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, SshError> {
        let key = match auth {
            SshAuth::KeyFile(path) => Arc::new(load_key(&path)?),
            SshAuth::Key(key) => key,
        };

        let config = Arc::new(client::Config::default());
        let handler = ClientHandler::new(&server.host, policy);
        let addr = format!("{}:22", server.host);

        let mut handle =
            tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, addr.as_str(), handler))
                .await
                .map_err(|_| SshError::DialTimeout {
                    host: server.host.clone(),
                })?
                .map_err(|e| match e {
                    russh::Error::UnknownKey => SshError::HostKeyMismatch {
                        host: server.host.clone(),
                    },
                    source => SshError::Connect {
                        host: server.host.clone(),
                        source,
                    },
                })?;

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth_result = handle
            .authenticate_publickey(&server.username, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await?;

        if !matches!(auth_result, AuthResult::Success) {
            return Err(SshError::Auth {
                host: server.host.clone(),
                user: server.username.clone(),
            });
        }

        debug!(host = %server.host, user = %server.username, "ssh session established");

        Ok(Self {
            handle,
            host: server.host.clone(),
            sink,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run a command, streaming stdout and stderr to the sink.
    /// Non-zero exit is an error carrying the code and a stderr tail.
    pub async fn exec(&self, command: &str) -> Result<(), SshError> {
        self.run(command, false).await.map(|_| ())
    }

    /// Run a command and return its buffered stdout. Stderr is still
    /// streamed to the sink.
    pub async fn exec_capture(&self, command: &str) -> Result<String, SshError> {
        self.run(command, true).await
    }

    /// Content of `/etc/machine-id`, trimmed.
    pub async fn machine_id(&self) -> Result<String, SshError> {
        Ok(self.exec_capture("cat /etc/machine-id").await?.trim().to_string())
    }

    /// Remote hostname, trimmed.
    pub async fn hostname(&self) -> Result<String, SshError> {
        Ok(self.exec_capture("hostname").await?.trim().to_string())
    }

    async fn run(&self, command: &str, capture: bool) -> Result<String, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut captured = String::new();
        let mut stderr_tail: Vec<String> = Vec::new();
        let mut exit_status: Option<u32> = None;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };
            match msg {
                ChannelMsg::Data { ref data } => {
                    if capture {
                        captured.push_str(&String::from_utf8_lossy(data));
                    }
                    stdout.push(data, |line| self.sink.stdout_line(&self.host, line));
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.push(data, |line| {
                        self.sink.stderr_line(&self.host, line);
                        if stderr_tail.len() >= 8 {
                            stderr_tail.remove(0);
                        }
                        stderr_tail.push(line.to_string());
                    });
                }
                ChannelMsg::ExitStatus { exit_status: code } => {
                    exit_status = Some(code);
                }
                _ => {}
            }
        }

        stdout.flush(|line| self.sink.stdout_line(&self.host, line));
        stderr.flush(|line| {
            self.sink.stderr_line(&self.host, line);
            stderr_tail.push(line.to_string());
        });

        match exit_status {
            Some(0) => Ok(captured),
            Some(code) => Err(SshError::CommandFailed {
                host: self.host.clone(),
                code,
                stderr: stderr_tail.join("\n"),
            }),
            None => Err(SshError::NoExitStatus {
                host: self.host.clone(),
            }),
        }
    }

    /// Close the connection. Idempotent; a failed disconnect is ignored
    /// because the transport may already be gone.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_newlines() {
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        buffer.push(b"one\ntwo\nthr", |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["one", "two"]);

        buffer.push(b"ee\n", |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn line_buffer_flushes_trailing_partial_line() {
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        buffer.push(b"no newline", |l| lines.push(l.to_string()));
        assert!(lines.is_empty());

        buffer.flush(|l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["no newline"]);
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        buffer.push(b"crlf\r\n", |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["crlf"]);
    }

    #[test]
    fn expand_key_path_replaces_tilde() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_key_path("~/.ssh/id_rsa");
            assert_eq!(
                expanded,
                format!("{}/.ssh/id_rsa", home.to_string_lossy())
            );
        }
    }

    #[test]
    fn expand_key_path_leaves_absolute_paths() {
        assert_eq!(expand_key_path("/etc/keys/id_rsa"), "/etc/keys/id_rsa");
    }
}
