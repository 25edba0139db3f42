use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_SALT: &[u8] = b"pagewire/client-binding";
const KEY_INFO: &[u8] = b"pagewire/id-cipher";

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("hkdf expand failure")]
    HkdfExpand,
    #[error("encryption failure")]
    Encrypt(#[source] chacha20poly1305::aead::Error),
    #[error("decryption failure; the value was not issued to this client")]
    Decrypt(#[source] chacha20poly1305::aead::Error),
    #[error("invalid envelope encoding")]
    InvalidEnvelope,
    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),
}

/// Seals identifiers handed to peers so they can only be replayed from the
/// address they were issued to.
#[derive(Clone)]
pub struct IdCipher {
    key: [u8; 32],
}

impl IdCipher {
    pub fn from_master_secret(master_secret: &str) -> Result<Self, SecurityError> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), master_secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|_| SecurityError::HkdfExpand)?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, value: &str, client_ip: &str) -> Result<String, SecurityError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value.as_bytes(),
                    aad: client_ip.as_bytes(),
                },
            )
            .map_err(SecurityError::Encrypt)?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64_URL.encode(envelope))
    }

    pub fn decrypt(&self, envelope: &str, client_ip: &str) -> Result<String, SecurityError> {
        let bytes = BASE64_URL.decode(envelope.trim())?;
        if bytes.len() <= NONCE_LEN {
            return Err(SecurityError::InvalidEnvelope);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plain = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: client_ip.as_bytes(),
                },
            )
            .map_err(SecurityError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| SecurityError::InvalidEnvelope)
    }
}

impl std::fmt::Debug for IdCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCipher").finish_non_exhaustive()
    }
}
