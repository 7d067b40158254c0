//! Entries sealed to a recipient's X25519 public key.
//!
//! Layout: `ephemeral public key (32) | nonce (12) | AES-256-GCM ciphertext`.
//! The AEAD key is derived with blake3 from the Diffie-Hellman secret and both
//! public keys. The tag check is what turns a wrong recipient into
//! [`CodecError::Undecodable`].

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use arrayref::array_ref;
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{from_document, to_document, CodecError};
use crate::{identity::Keypair, work::WorkUnit};

const KDF_CONTEXT: &str = "orbit 2023-10 sealed blob entry";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const HEADER_LEN: usize = KEY_LEN + NONCE_LEN;

fn entry_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut material = [0u8; 3 * KEY_LEN];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral);
    material[64..].copy_from_slice(recipient);
    blake3::derive_key(KDF_CONTEXT, &material)
}

/// Encrypts `plaintext` so only the owner of `recipient` can read it.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    let key = entry_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient);

    let nonce: [u8; NONCE_LEN] = rand::random();
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CodecError::Crypto)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CodecError::Crypto)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an entry sealed to `keypair`'s public key.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
    if sealed.len() < HEADER_LEN + AEAD_TAG_LEN {
        return Err(CodecError::Undecodable);
    }
    let ephemeral = array_ref![sealed, 0, KEY_LEN];
    let nonce = array_ref![sealed, KEY_LEN, NONCE_LEN];
    let shared = keypair.diffie_hellman(ephemeral);
    let key = entry_key(shared.as_bytes(), ephemeral, &keypair.public_bytes());

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CodecError::Crypto)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), &sealed[HEADER_LEN..])
        .map_err(|_| CodecError::Undecodable)
}

pub fn encode_unit(recipient: &[u8; 32], unit: &WorkUnit) -> Result<Vec<u8>, CodecError> {
    seal(recipient, to_document(unit)?.as_bytes())
}

pub fn decode_unit(keypair: &Keypair, sealed: &[u8]) -> Result<WorkUnit, CodecError> {
    let plaintext = open(keypair, sealed)?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| CodecError::Undecodable)?;
    from_document(text).map_err(|_| CodecError::Undecodable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_can_open() {
        let keypair = Keypair::generate();
        let unit = WorkUnit::new("secret", "emit only for you");
        let sealed = encode_unit(&keypair.public_bytes(), &unit).unwrap();
        assert_eq!(decode_unit(&keypair, &sealed).unwrap(), unit);
    }

    #[test]
    fn other_keys_cannot_open() {
        let keypair = Keypair::generate();
        let sealed = encode_unit(&keypair.public_bytes(), &WorkUnit::new("s", "x")).unwrap();
        for _ in 0..8 {
            let other = Keypair::generate();
            assert!(matches!(
                decode_unit(&other, &sealed),
                Err(CodecError::Undecodable)
            ));
        }
    }

    #[test]
    fn tampering_is_detected() {
        let keypair = Keypair::generate();
        let mut sealed = seal(&keypair.public_bytes(), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(open(&keypair, &sealed), Err(CodecError::Undecodable)));
        assert!(matches!(open(&keypair, &sealed[..10]), Err(CodecError::Undecodable)));
    }

    #[test]
    fn sealing_is_randomized() {
        let keypair = Keypair::generate();
        let a = seal(&keypair.public_bytes(), b"same").unwrap();
        let b = seal(&keypair.public_bytes(), b"same").unwrap();
        assert_ne!(a, b);
    }
}
