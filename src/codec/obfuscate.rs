//! Substitution codec keyed by a correlation id.
//!
//! This is an obfuscation, not encryption. The key travels next to the
//! payload and anyone who knows the algorithm can reverse it. It exists to
//! shrink textual payloads and keep them unreadable at a glance; use
//! [`super::sealed`] when the content has to stay secret.
//!
//! The key seeds a generator that picks a byte offset and a permutation of
//! [`RESERVED`]. Bytes up to and including the space pass through untouched,
//! so the text keeps its tokenization. A whitespace separated token found in
//! the table becomes a single byte `0x80 + index + offset`; every other
//! character is masked to 7 bits and shifted by the offset. Non-ASCII input is
//! therefore lossy, which is why documents are ASCII-escaped before they get
//! here. A 16 byte keyed digest of the text leads the output so that
//! revealing with the wrong key fails instead of producing garbage.

use hashbrown::HashMap;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use super::{from_document, to_document, CodecError, CorrelationId};
use crate::work::WorkUnit;

const SEED_CONTEXT: &str = "orbit 2023-10 obfuscation seed";
const TAG_LEN: usize = 16;
const FIRST_CHAR: u8 = 0x21;
const KEYWORD_BASE: u8 = 0x80;

/// Tokens worth a single byte: the structural pieces of a pretty printed
/// work unit or checkpoint document, plus the directive keywords.
pub const RESERVED: &[&str] = &[
    "{",
    "}",
    "},",
    "{}",
    "{},",
    "[",
    "]",
    "],",
    "[]",
    "[],",
    "null",
    "null,",
    "true",
    "true,",
    "false",
    "false,",
    "\"name\":",
    "\"code\":",
    "\"version\":",
    "\"packages\":",
    "\"imports\":",
    "\"wait_on\":",
    "\"source\":",
    "\"*\",",
    "\"1.0.0\",",
    "\"identity\":",
    "\"id\":",
    "\"address\":",
    "\"public_key\":",
    "\"next\":",
    "\"regional_next\":",
    "\"queue\":",
    "\"nodes\":",
    "\"taken_at\":",
    "\"emit",
    "\"set",
    "\"fail",
    "emit",
    "set",
    "fail",
    "=",
    "from",
    "{node}",
    "{round}",
    "{address}",
    "{counter}",
];

struct Table {
    offset: u8,
    codes: HashMap<&'static [u8], u8>,
    tokens: Vec<&'static str>,
    seed: [u8; 32],
}

impl Table {
    fn derive(key: &CorrelationId) -> Self {
        let seed = blake3::derive_key(SEED_CONTEXT, &key.0);
        let mut rng = StdRng::from_seed(seed);
        // keeps every keyword byte inside 0x80..=0xff
        let max_offset = (KEYWORD_BASE as usize - RESERVED.len()) as u8;
        let offset = rng.gen_range(0..=max_offset);
        let mut tokens = RESERVED.to_vec();
        tokens.shuffle(&mut rng);
        let codes = tokens
            .iter()
            .copied()
            .enumerate()
            .map(|(i, token)| (token.as_bytes(), KEYWORD_BASE + i as u8 + offset))
            .collect();
        Self {
            offset,
            codes,
            tokens,
            seed,
        }
    }

    fn tag(&self, text: &[u8]) -> [u8; TAG_LEN] {
        let digest = blake3::keyed_hash(&self.seed, text);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest.as_bytes()[..TAG_LEN]);
        tag
    }
}

fn passes_through(byte: u8) -> bool {
    byte < FIRST_CHAR
}

/// Maps text onto the codec's alphabet: ASCII stays, anything else is masked
/// to 7 bits and replaced by `?` if that lands on a control character.
fn normalize(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| {
            if ch.is_ascii() {
                ch as u8
            } else {
                match (ch as u32 & 0x7f) as u8 {
                    masked if masked < FIRST_CHAR => b'?',
                    masked => masked,
                }
            }
        })
        .collect()
}

/// Obfuscates `text` under `key`.
pub fn conceal(key: &CorrelationId, text: &str) -> Vec<u8> {
    let table = Table::derive(key);
    let plain = normalize(text);
    let mut out = Vec::with_capacity(TAG_LEN + plain.len());
    out.extend_from_slice(&table.tag(&plain));

    let mut rest = plain.as_slice();
    while let Some(&first) = rest.first() {
        let in_gap = passes_through(first);
        let len = rest
            .iter()
            .position(|&b| passes_through(b) != in_gap)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(len);
        rest = tail;

        if in_gap {
            out.extend_from_slice(segment);
        } else if let Some(&code) = table.codes.get(segment) {
            out.push(code);
        } else {
            out.extend(segment.iter().map(|&b| (b & 0x7f) + table.offset));
        }
    }
    out
}

/// Reverses [`conceal`]. Fails with [`CodecError::Undecodable`] when `key`
/// is not the key the bytes were concealed under.
pub fn reveal(key: &CorrelationId, bytes: &[u8]) -> Result<String, CodecError> {
    if bytes.len() < TAG_LEN {
        return Err(CodecError::Undecodable);
    }
    let table = Table::derive(key);
    let (tag, body) = bytes.split_at(TAG_LEN);

    let mut plain = Vec::with_capacity(body.len() * 2);
    for &byte in body {
        if passes_through(byte) {
            plain.push(byte);
            continue;
        }
        let adjusted = byte.wrapping_sub(table.offset);
        if adjusted >= KEYWORD_BASE {
            let token = table
                .tokens
                .get((adjusted - KEYWORD_BASE) as usize)
                .ok_or(CodecError::Undecodable)?;
            plain.extend_from_slice(token.as_bytes());
        } else if adjusted >= FIRST_CHAR {
            plain.push(adjusted);
        } else {
            return Err(CodecError::Undecodable);
        }
    }

    if table.tag(&plain) != tag {
        return Err(CodecError::Undecodable);
    }
    String::from_utf8(plain).map_err(|_| CodecError::Undecodable)
}

pub fn encode_unit(key: &CorrelationId, unit: &WorkUnit) -> Result<Vec<u8>, CodecError> {
    Ok(conceal(key, &to_document(unit)?))
}

pub fn decode_unit(key: &CorrelationId, bytes: &[u8]) -> Result<WorkUnit, CodecError> {
    let text = reveal(key, bytes)?;
    from_document(&text).map_err(|_| CodecError::Undecodable)
}
