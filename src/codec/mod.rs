//! Blob codecs.
//!
//! A [`Blob`] maps per-recipient keys to encoded work units. Two strategies
//! produce the entries:
//!
//! - [`obfuscate`] keys every entry with a fresh random [`CorrelationId`]. It
//!   shrinks and disguises the payload but is *not* confidential: anyone who
//!   holds the blob holds the keys.
//! - [`sealed`] encrypts every entry to the recipient's X25519 public key.
//!   Only the holder of the matching secret can open it, which makes it the
//!   strategy to use whenever intermediate hops are not trusted.
//!
//! Either way, opening an entry with the wrong key yields
//! [`CodecError::Undecodable`] and never a corrupted unit.

use std::fmt::Write as _;

use rkyv::{Archive, Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::{
    hex::HexExt,
    identity::{Keypair, NodeIdentity},
    work::WorkUnit,
};

pub mod obfuscate;
pub mod sealed;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload cannot be decoded with this key")]
    Undecodable,
    #[error("sealing requires the recipient's public key")]
    MissingRecipientKey,
    #[error("document encoding failed: {0}")]
    Document(#[from] serde_json::Error),
    #[error("encryption failed")]
    Crypto,
}

/// Which strategy a deployment encodes blob entries with.
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodecPolicy {
    #[default]
    Obfuscate,
    Seal,
}

/// Random per-entry key.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CorrelationId(pub [u8; 16]);

impl CorrelationId {
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum BlobKey {
    /// Obfuscated entry; the key itself is enough to decode it.
    Correlation(CorrelationId),
    /// Entry sealed to `recipient`'s public key. The correlation id keeps
    /// several units for one recipient apart.
    Sealed {
        recipient: [u8; 32],
        correlation: CorrelationId,
    },
}

impl BlobKey {
    /// True if a node holding `keypair` can attempt to decode the entry.
    pub fn resolves_for(&self, keypair: Option<&Keypair>) -> bool {
        match self {
            BlobKey::Correlation(_) => true,
            BlobKey::Sealed { recipient, .. } => {
                keypair.map_or(false, |kp| kp.public_bytes() == *recipient)
            }
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
struct BlobEntry {
    key: BlobKey,
    payload: Vec<u8>,
}

/// Work units in transit between nodes.
///
/// Entries are a list with unique keys. An archived map would be validated
/// by rehashing archived `BlobKey`s, whose hash differs from the native one.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default)]
#[archive(check_bytes)]
pub struct Blob {
    entries: Vec<BlobEntry>,
    /// Address of the node that sent a request blob, so the receiver knows
    /// where to push its surplus.
    reply_to: Option<String>,
}

/// Units a node could decode out of a blob.
#[derive(Debug, Default)]
pub struct Opened {
    pub units: Vec<WorkUnit>,
    /// Entries addressed to this node that failed to decode.
    pub undecodable: usize,
    /// Entries addressed to someone else.
    pub foreign: usize,
}

impl Blob {
    /// An entry-less blob asking the receiver to consider sending work back.
    pub fn request(reply_to: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            reply_to: Some(reply_to.into()),
        }
    }

    /// Encodes `units` for `recipient` with `policy`. Every unit gets its own
    /// fresh correlation id.
    pub fn pack(
        policy: CodecPolicy,
        recipient: Option<&NodeIdentity>,
        units: &[WorkUnit],
    ) -> Result<Self, CodecError> {
        let mut blob = Blob::default();
        for unit in units {
            let correlation = CorrelationId::new();
            match policy {
                CodecPolicy::Obfuscate => {
                    let payload = obfuscate::encode_unit(&correlation, unit)?;
                    blob.insert(BlobKey::Correlation(correlation), payload);
                }
                CodecPolicy::Seal => {
                    let recipient = recipient
                        .and_then(|identity| identity.public_key)
                        .ok_or(CodecError::MissingRecipientKey)?;
                    let payload = sealed::encode_unit(&recipient, unit)?;
                    blob.insert(
                        BlobKey::Sealed {
                            recipient,
                            correlation,
                        },
                        payload,
                    );
                }
            }
        }
        Ok(blob)
    }

    /// Adds an entry, replacing any earlier entry under the same key.
    pub fn insert(&mut self, key: BlobKey, payload: Vec<u8>) {
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.payload = payload,
            None => self.entries.push(BlobEntry { key, payload }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BlobKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    /// Number of entries a node holding `keypair` may try to decode.
    pub fn resolvable(&self, keypair: Option<&Keypair>) -> usize {
        self.keys().filter(|key| key.resolves_for(keypair)).count()
    }

    /// Decodes a single entry as seen by its intended recipient.
    pub fn silhouette(
        &self,
        key: &BlobKey,
        keypair: Option<&Keypair>,
    ) -> Result<WorkUnit, CodecError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.key == *key)
            .ok_or(CodecError::Undecodable)?;
        decode_entry(key, &entry.payload, keypair)
    }

    /// Decodes every entry this node can resolve. Failures are counted, not
    /// returned.
    pub fn open(&self, keypair: Option<&Keypair>) -> Opened {
        let mut opened = Opened::default();
        for BlobEntry { key, payload } in &self.entries {
            if !key.resolves_for(keypair) {
                opened.foreign += 1;
                continue;
            }
            match decode_entry(key, payload, keypair) {
                Ok(unit) => opened.units.push(unit),
                Err(_) => opened.undecodable += 1,
            }
        }
        opened
    }

    /// Splits the blob back into its entries.
    pub fn into_entries(self) -> impl Iterator<Item = (BlobKey, Vec<u8>)> {
        self.entries
            .into_iter()
            .map(|BlobEntry { key, payload }| (key, payload))
    }
}

fn decode_entry(
    key: &BlobKey,
    payload: &[u8],
    keypair: Option<&Keypair>,
) -> Result<WorkUnit, CodecError> {
    match key {
        BlobKey::Correlation(correlation) => obfuscate::decode_unit(correlation, payload),
        BlobKey::Sealed { recipient, .. } => match keypair {
            Some(keypair) if keypair.public_bytes() == *recipient => {
                sealed::decode_unit(keypair, payload)
            }
            _ => Err(CodecError::Undecodable),
        },
    }
}

/// Renders `value` as pretty printed, pure ASCII JSON. Whitespace separates
/// the structural tokens so the obfuscation table can substitute them, and
/// escaping keeps the text inside the codec's 7 bit alphabet.
pub fn to_document<T: serde::Serialize>(value: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string_pretty(value)?;
    if text.is_ascii() {
        return Ok(text);
    }
    // non-ASCII characters can only occur inside JSON strings, where a
    // \u escape is always valid
    let mut escaped = String::with_capacity(text.len() + 16);
    let mut units = [0u16; 2];
    for ch in text.chars() {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut units) {
                let _ = write!(escaped, "\\u{:04x}", unit);
            }
        }
    }
    Ok(escaped)
}

pub fn from_document<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobKey::Correlation(id) => write!(f, "corr:{}", id.0.hex()),
            BlobKey::Sealed {
                recipient,
                correlation,
            } => write!(f, "sealed:{}/{}", recipient.short_hex(), correlation.0.hex()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: usize) -> Vec<WorkUnit> {
        (0..n)
            .map(|i| WorkUnit::new(format!("unit-{i}"), format!("emit unit {i} on {{node}}")))
            .collect()
    }

    #[test]
    fn obfuscated_blob_opens_anywhere() {
        let blob = Blob::pack(CodecPolicy::Obfuscate, None, &units(3)).unwrap();
        assert_eq!(blob.len(), 3);
        assert_eq!(blob.resolvable(None), 3);

        let mut opened = blob.open(None).units;
        opened.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(opened, units(3));
    }

    #[test]
    fn sealed_blob_opens_only_for_recipient() {
        let recipient = Keypair::generate();
        let bystander = Keypair::generate();
        let identity = NodeIdentity::keyed("r", &recipient);
        let blob = Blob::pack(CodecPolicy::Seal, Some(&identity), &units(2)).unwrap();

        let opened = blob.open(Some(&recipient));
        assert_eq!(opened.units.len(), 2);
        assert_eq!(opened.undecodable, 0);

        let opened = blob.open(Some(&bystander));
        assert!(opened.units.is_empty());
        assert_eq!(opened.foreign, 2);
        assert_eq!(blob.resolvable(Some(&bystander)), 0);
        assert_eq!(blob.resolvable(None), 0);
    }

    #[test]
    fn sealing_needs_a_public_key() {
        let anonymous = NodeIdentity::anonymous("r");
        let err = Blob::pack(CodecPolicy::Seal, Some(&anonymous), &units(1)).unwrap_err();
        assert!(matches!(err, CodecError::MissingRecipientKey));
    }

    #[test]
    fn corrupted_entry_is_counted_not_returned() {
        let mut blob = Blob::pack(CodecPolicy::Obfuscate, None, &units(2)).unwrap();
        blob.insert(BlobKey::Correlation(CorrelationId::new()), vec![0x41; 40]);

        let opened = blob.open(None);
        assert_eq!(opened.units.len(), 2);
        assert_eq!(opened.undecodable, 1);
    }

    #[test]
    fn silhouette_of_missing_key_is_undecodable() {
        let blob = Blob::pack(CodecPolicy::Obfuscate, None, &units(1)).unwrap();
        let key = *blob.keys().next().unwrap();
        assert_eq!(blob.silhouette(&key, None).unwrap(), units(1)[0]);

        let missing = BlobKey::Correlation(CorrelationId::new());
        assert!(matches!(
            blob.silhouette(&missing, None),
            Err(CodecError::Undecodable)
        ));
    }

    #[test]
    fn inserting_an_existing_key_replaces_it() {
        let mut blob = Blob::default();
        let key = BlobKey::Correlation(CorrelationId::new());
        blob.insert(key, vec![1]);
        blob.insert(key, vec![2]);
        assert_eq!(blob.len(), 1);
        assert_eq!(blob.into_entries().collect::<Vec<_>>(), vec![(key, vec![2])]);
    }

    #[test]
    fn documents_are_ascii() {
        let unit = WorkUnit::new("grüße", "emit ✓ done");
        let text = to_document(&unit).unwrap();
        assert!(text.is_ascii());
        let back: WorkUnit = from_document(&text).unwrap();
        assert_eq!(back, unit);
    }
}
