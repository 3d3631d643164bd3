//! Hash rendering for indirect root names.

use sha1::{Digest, Sha1};

/// The store's base-32 alphabet. Omits `e`, `o`, `u` and `t` to avoid
/// accidental words in generated names.
const BASE32_CHARS: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Render `bytes` in the store's base-32 alphabet, most significant digit
/// first.
pub fn to_base32(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = String::with_capacity(len);
    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let lo = u16::from(bytes[i]) >> j;
        let hi = if i + 1 < bytes.len() {
            u16::from(bytes[i + 1]) << (8 - j)
        } else {
            0
        };
        let c = (lo | hi) & 0x1f;
        out.push(BASE32_CHARS[c as usize] as char);
    }
    out
}

/// Base-32 rendering of the SHA-1 digest of `input`; used to derive stable
/// filesystem names for indirect roots.
pub fn sha1_base32(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    to_base32(digest.as_slice())
}
