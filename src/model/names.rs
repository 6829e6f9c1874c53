//! Content-addressed calculation names.
//!
//! A calculation created for a bulk member is named after a hash of its
//! input parameters so that resubmitting the same inputs maps onto the same
//! object instead of a duplicate.

use sha2::{Digest, Sha256};

use super::calculation::Params;

/// Alphabet for the name encoding. Lowercase consonants plus digits keeps
/// names DNS-safe and avoids accidental words.
const NAME_ALPHABET: &[u8; 32] = b"bcdfghijklmnpqrstvwxyz0123456789";

/// Number of digest bytes carried into the name. 10 bytes encode to 16
/// characters in the 5-bit alphabet.
const DIGEST_PREFIX_LEN: usize = 10;

fn encode_name(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(NAME_ALPHABET[index as usize] as char);
        }
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(NAME_ALPHABET[index as usize] as char);
    }
    out
}

/// Hash a sequence of input fragments into a short stable identifier.
pub fn input_hash(inputs: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(input);
    }
    let digest = hasher.finalize();
    encode_name(&digest[..DIGEST_PREFIX_LEN])
}

/// Derive the canonical name for a calculation with the given parameters.
pub fn calculation_name(params: &Params) -> String {
    let teff = format!("teff={}", params.teff);
    let log_g = format!("log_g={}", params.log_g);
    format!(
        "calc-{}",
        input_hash(&[teff.as_bytes(), log_g.as_bytes()])
    )
}

/// Name of the single generation calculation a factory runs.
pub fn factory_calculation_name(factory_name: &str) -> String {
    format!("calc-factory-{factory_name}")
}

/// Name of the calculation run once after all bulk members finish. Derived
/// from the bulk name rather than the parameters so it can never collide
/// with a member calculation.
pub fn post_calculation_name(bulk_name: &str) -> String {
    format!("calc-post-{bulk_name}")
}
