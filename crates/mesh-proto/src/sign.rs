use crate::envelope::Envelope;
use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix on the wire.
pub const SIG_PREFIX: &str = "sha256:";

/// The byte sequence a signature covers: the compact JSON encoding of the
/// envelope with the `signature` field removed. Both sides serialize the
/// same typed struct, so the bytes match without further canonicalization.
pub fn signing_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut unsigned = envelope.clone();
    unsigned.signature = None;
    serde_json::to_vec(&unsigned).context("failed to serialize envelope for signing")
}

/// Compute the envelope signature: `sha256:` + base64(HMAC-SHA256).
pub fn sign(envelope: &Envelope, key: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid signing key")?;
    mac.update(&signing_bytes(envelope)?);
    let digest = mac.finalize().into_bytes();
    Ok(format!(
        "{SIG_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    ))
}

/// Attach a signature to the envelope in place.
pub fn sign_envelope(envelope: &mut Envelope, key: &[u8]) -> Result<()> {
    envelope.signature = None;
    envelope.signature = Some(sign(envelope, key)?);
    Ok(())
}

/// Verify the envelope's signature against a shared key. Returns `false`
/// for a missing or malformed signature rather than erroring.
pub fn verify(envelope: &Envelope, key: &[u8]) -> bool {
    let Some(sig) = envelope.signature.as_deref() else {
        return false;
    };
    let Some(encoded) = sig.strip_prefix(SIG_PREFIX) else {
        return false;
    };
    let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(bytes) = signing_bytes(envelope) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(&bytes);
    mac.verify_slice(&provided).is_ok()
}
