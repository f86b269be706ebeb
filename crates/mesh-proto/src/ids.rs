use anyhow::{Result, bail};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt::Write as _;

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Decode a hex string (case-insensitive, no separators).
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| anyhow::anyhow!("invalid hex byte"))
        })
        .collect()
}

/// `n` random bytes from the OS RNG, hex-encoded.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    to_hex(&buf)
}

/// Fresh message identifier, `msg_` prefix + 128 random bits.
pub fn message_id() -> String {
    format!("msg_{}", random_hex(16))
}

/// Fresh conversation identifier.
pub fn conversation_id() -> String {
    format!("conv_{}", random_hex(8))
}

/// Per-message replay nonce.
pub fn nonce() -> String {
    random_hex(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x7f, 0xff, 0x10];
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = message_id();
        let b = message_id();
        assert!(a.starts_with("msg_"));
        assert_eq!(a.len(), 4 + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(nonce(), nonce());
    }
}
