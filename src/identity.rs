// Node identities are deliberately small. A node is known by a 32 byte id, the
// address it answers on and, when the deployment seals payloads, the X25519
// public key that blob entries for it are sealed to. The id of a keyed node is
// the blake3 digest of its public key so that any holder of the identity can
// check the two belong together.

use std::fmt;

use blake3::hash;
use rand::rngs::OsRng;
use rkyv::{Archive, Deserialize, Serialize};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::hex::HexExt;

pub type NodeId = [u8; 32];

/// The version tag every identity minted by this build carries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Public description of a ring member, as answered by `Info`.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
#[archive(check_bytes)]
pub struct NodeIdentity {
    pub id: NodeId,
    /// Transport address the node answers on. The only field that may change
    /// after startup.
    pub address: String,
    /// X25519 public key sealed payloads are encrypted to.
    pub public_key: Option<[u8; 32]>,
    pub version: String,
}

impl NodeIdentity {
    /// Mints an identity for a node without a keypair.
    pub fn anonymous(address: impl Into<String>) -> Self {
        Self {
            id: rand::random(),
            address: address.into(),
            public_key: None,
            version: VERSION.into(),
        }
    }

    /// Mints an identity bound to `keypair`.
    pub fn keyed(address: impl Into<String>, keypair: &Keypair) -> Self {
        let public_key = keypair.public_bytes();
        Self {
            id: *hash(&public_key).as_bytes(),
            address: address.into(),
            public_key: Some(public_key),
            version: VERSION.into(),
        }
    }

    /// Returns true if the id is the digest of the advertised public key.
    /// Anonymous identities always validate.
    pub fn validate_self_id(&self) -> bool {
        match self.public_key {
            Some(pk) => *hash(&pk).as_bytes() == self.id,
            None => true,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short_hex(), self.address)
    }
}

/// A node's X25519 keypair. Never serialized: checkpoints only carry the
/// public half through [`NodeIdentity`].
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub(crate) fn diffie_hellman(&self, their_public: &[u8; 32]) -> SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(*their_public))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public_bytes().short_hex())
    }
}
