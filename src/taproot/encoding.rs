//! Big-integer and byte-buffer encodings plus BIP-340 tagged hashing.
//!
//! Conversions are fixed-width and fail loudly when a value does not fit,
//! since a silently truncated key or hash would produce an address nobody
//! can spend from.

use num_bigint::{BigInt, Sign};
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

/// BIP-340 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// Bitcoin compact-size encoding of a length
pub fn compact_size(n: usize) -> Vec<u8> {
    match n {
        0..=0xfc => vec![n as u8],
        0xfd..=0xffff => {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(n as u16).to_le_bytes());
            v
        }
        _ => {
            let mut v = vec![0xfe];
            v.extend_from_slice(&(n as u32).to_le_bytes());
            v
        }
    }
}

/// Interpret a big-endian byte buffer as a non-negative integer
pub fn bigint_from_bytes_be(bytes: &[u8]) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, bytes)
}

/// Encode a non-negative integer as a fixed-width big-endian buffer
pub fn bigint_to_bytes_be(n: &BigInt, width: usize) -> VaultResult<Vec<u8>> {
    let (sign, bytes) = n.to_bytes_be();
    if sign == Sign::Minus {
        return Err(VaultError::crypto("cannot encode negative integer"));
    }
    if bytes.len() > width {
        return Err(VaultError::crypto(format!(
            "integer does not fit in {width} bytes"
        )));
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Encode a field element or x-only key as exactly 32 big-endian bytes
pub fn bigint_to_32_bytes(n: &BigInt) -> VaultResult<[u8; 32]> {
    let v = bigint_to_bytes_be(n, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&v);
    Ok(out)
}

/// Interpret a 20-byte (160-bit) buffer as an integer
pub fn bigint_from_bytes_160(bytes: &[u8]) -> VaultResult<BigInt> {
    if bytes.len() != 20 {
        return Err(VaultError::crypto(format!(
            "expected 20 bytes for a 160-bit value, got {}",
            bytes.len()
        )));
    }
    Ok(bigint_from_bytes_be(bytes))
}

/// Split a 256-bit integer into eight 32-bit limbs, least significant first
pub fn u256_to_limbs_le(n: &BigInt) -> VaultResult<[u32; 8]> {
    let bytes = bigint_to_32_bytes(n)?;
    let mut limbs = [0u32; 8];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let off = 32 - 4 * (i + 1);
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[off..off + 4]);
        *limb = u32::from_be_bytes(word);
    }
    Ok(limbs)
}

/// Split a 256-bit integer into eight 32-bit limbs, most significant first
pub fn u256_to_limbs_be(n: &BigInt) -> VaultResult<[u32; 8]> {
    let mut limbs = u256_to_limbs_le(n)?;
    limbs.reverse();
    Ok(limbs)
}

/// Reassemble a 256-bit integer from least-significant-first limbs
pub fn limbs_le_to_u256(limbs: &[u32; 8]) -> BigInt {
    let mut n = BigInt::from(0u8);
    for limb in limbs.iter().rev() {
        n = (n << 32) | BigInt::from(*limb);
    }
    n
}

/// Reassemble a 256-bit integer from most-significant-first limbs
pub fn limbs_be_to_u256(limbs: &[u32; 8]) -> BigInt {
    let mut reversed = *limbs;
    reversed.reverse();
    limbs_le_to_u256(&reversed)
}
