//! The keystore collaborator (§6.3): resolves key names to keypairs and
//! public keys for the authenticated auth path (§4.2). Keystore layout,
//! passphrases and on-disk format are explicitly out of scope (§1); this
//! is only the trait seam plus an in-memory implementation for tests and
//! simple embedders.

use netsync_core::{Id, RsaKeypair};
use rsa::RsaPublicKey;
use std::collections::HashMap;

/// Resolves key identities to key material. An embedder backs this with
/// whatever on-disk or OS keychain format it wants.
pub trait Keystore: Send + Sync {
    /// The keypair this side authenticates as, if any (anonymous sessions
    /// have none).
    fn identity(&self) -> Option<&RsaKeypair>;

    /// Look up a known peer's public key by its key id (§4.2: the server
    /// validating a client's signature, or vice versa).
    fn public_key(&self, key_id: Id) -> Option<RsaPublicKey>;
}

/// An in-memory keystore: one optional local identity plus a table of
/// known peer public keys.
#[derive(Default)]
pub struct InMemoryKeystore {
    identity: Option<RsaKeypair>,
    known_peers: HashMap<Id, RsaPublicKey>,
}

impl InMemoryKeystore {
    /// An anonymous keystore: no local identity, no trusted peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A keystore that authenticates as `identity`.
    pub fn with_identity(identity: RsaKeypair) -> Self {
        Self {
            identity: Some(identity),
            known_peers: HashMap::new(),
        }
    }

    /// Record `public_key` as the key behind `key_id`, so a later signature
    /// from that peer (a cert, or the auth path) can be verified.
    pub fn trust_peer(&mut self, key_id: Id, public_key: RsaPublicKey) {
        self.known_peers.insert(key_id, public_key);
    }
}

impl Keystore for InMemoryKeystore {
    fn identity(&self) -> Option<&RsaKeypair> {
        self.identity.as_ref()
    }

    fn public_key(&self, key_id: Id) -> Option<RsaPublicKey> {
        self.known_peers.get(&key_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_keystore_has_no_identity() {
        let ks = InMemoryKeystore::new();
        assert!(ks.identity().is_none());
    }

    #[test]
    fn trusted_peer_is_resolvable() {
        let keypair = RsaKeypair::generate(1024).unwrap();
        let key_id = keypair.key_id();
        let mut ks = InMemoryKeystore::new();
        ks.trust_peer(key_id, keypair.public());
        assert!(ks.public_key(key_id).is_some());
    }
}
