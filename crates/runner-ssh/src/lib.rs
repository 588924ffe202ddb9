//! Remote shell client and ephemeral SSH key lifecycle.
//!
//! [`SshClient`] opens an authenticated session to a host and runs stage
//! commands, streaming output to an injected sink. [`TempKeyManager`] owns
//! the one-shot keypair flow: generate, announce, wait for the operator,
//! pin host keys on first sight, and scrub the key from every
//! `authorized_keys` it touched. The [`sweeper`] finalizes keys whose
//! owning run died before revoking them.

pub mod client;
pub mod error;
pub mod keygen;
pub mod known_hosts;
pub mod readiness;
pub mod sweeper;
pub mod temp_key;

pub use client::{DiscardSink, HostKeyPolicy, OutputSink, SshAuth, SshClient};
pub use error::SshError;
pub use known_hosts::KnownHostKeys;
pub use temp_key::TempKeyManager;
