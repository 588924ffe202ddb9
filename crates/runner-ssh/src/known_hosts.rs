//! In-memory host key pinning (trust-on-first-use).
//!
//! The first contact with a host records its key; every later session in
//! the same run requires an exact match. The map lives for one
//! orchestrator process and is shared between the readiness waiter and
//! the stage workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;

/// Shared map from host address to the pinned server key.
#[derive(Debug, Clone, Default)]
pub struct KnownHostKeys {
    keys: Arc<Mutex<HashMap<String, PublicKey>>>,
}

impl KnownHostKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a host key. First sight wins; a repeat record for the same
    /// host is ignored so the pin never silently rotates mid-run.
    pub fn record(&self, host: &str, key: PublicKey) {
        let mut keys = self.keys.lock().expect("host key map poisoned");
        keys.entry(host.to_string()).or_insert(key);
    }

    /// The pinned key for a host, if one has been seen.
    pub fn get(&self, host: &str) -> Option<PublicKey> {
        let keys = self.keys.lock().expect("host key map poisoned");
        keys.get(host).cloned()
    }

    pub fn contains(&self, host: &str) -> bool {
        let keys = self.keys.lock().expect("host key map poisoned");
        keys.contains_key(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::{private::KeypairData, rand_core::OsRng, PrivateKey};

    fn test_key(comment: &str) -> PublicKey {
        let keypair =
            russh::keys::ssh_key::private::Ed25519Keypair::random(&mut OsRng);
        let private = PrivateKey::new(KeypairData::Ed25519(keypair), comment).unwrap();
        private.public_key().clone()
    }

    #[test]
    fn record_and_get() {
        let known = KnownHostKeys::new();
        assert!(known.get("h1").is_none());

        let key = test_key("a");
        known.record("h1", key.clone());
        assert!(known.contains("h1"));
        assert_eq!(known.get("h1").unwrap().key_data(), key.key_data());
    }

    #[test]
    fn first_sight_wins() {
        let known = KnownHostKeys::new();
        let first = test_key("a");
        let second = test_key("b");

        known.record("h1", first.clone());
        known.record("h1", second);
        assert_eq!(known.get("h1").unwrap().key_data(), first.key_data());
    }
}
