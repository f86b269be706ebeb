use crate::ids::{from_hex, to_hex};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_BYTES: usize = 32;
pub const IV_BYTES: usize = 16;

/// Cipher tag carried in the encrypted body wrapper.
pub const BODY_CIPHER: &str = "aes-256-cbc";

/// What `payload.body` is replaced with when encryption is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBody {
    pub enc: String,
    pub iv: String,
    pub data: String,
}

/// Encrypt a payload body with a shared 256-bit key. The IV is random per
/// message and travels hex-encoded alongside the base64 ciphertext.
pub fn encrypt_body(key: &[u8; KEY_BYTES], plaintext: &str) -> Result<EncryptedBody> {
    let mut iv = [0u8; IV_BYTES];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(EncryptedBody {
        enc: BODY_CIPHER.to_string(),
        iv: to_hex(&iv),
        data: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    })
}

/// Decrypt an encrypted body wrapper back into the plaintext body.
pub fn decrypt_body(key: &[u8; KEY_BYTES], body: &EncryptedBody) -> Result<String> {
    if body.enc != BODY_CIPHER {
        bail!("unsupported body cipher: {}", body.enc);
    }
    let iv_bytes = from_hex(&body.iv).context("encrypted body IV is not valid hex")?;
    if iv_bytes.len() != IV_BYTES {
        bail!("invalid IV length: {}", iv_bytes.len());
    }
    let mut iv = [0u8; IV_BYTES];
    iv.copy_from_slice(&iv_bytes);
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(&body.data)
        .context("encrypted body data is not valid base64")?;
    let plaintext = Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| anyhow!("decryption failed (wrong key?)"))?;
    String::from_utf8(plaintext).context("decrypted body is not valid UTF-8")
}

/// Parse a body string that may be an encrypted wrapper. Returns `None` for
/// plaintext bodies.
pub fn parse_encrypted(body: &str) -> Option<EncryptedBody> {
    let parsed: EncryptedBody = serde_json::from_str(body).ok()?;
    (parsed.enc == BODY_CIPHER).then_some(parsed)
}
