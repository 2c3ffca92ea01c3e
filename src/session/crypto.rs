//! Transcript encryption at rest.
//!
//! Envelope: `enc:v1:<base64(iv ‖ tag ‖ ciphertext)>` with AES-256-GCM, a
//! 16-byte IV, and a 16-byte auth tag. Both directions are total: on any
//! failure the input string comes back unchanged, and decrypting a value
//! without the prefix is a pass-through. Availability wins over
//! confidentiality here — a transcript must never become unreadable because
//! a key file went missing.
//!
//! The key is 32 random bytes at `<state_dir>/.session-key`, created lazily
//! with mode 0600 via temp-file + rename, and cached in memory afterwards.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// AES-256-GCM with the 16-byte IV the wire format mandates.
type TranscriptAead = AesGcm<Aes256, U16>;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_FILE: &str = ".session-key";

/// Encrypts and decrypts transcript strings with a lazily created key file.
pub struct SessionCipher {
    key_path: PathBuf,
    enabled: bool,
    key: Mutex<Option<[u8; KEY_LEN]>>,
}

impl SessionCipher {
    /// Cipher rooted at `state_dir`; the `SESSION_ENCRYPTION` env var
    /// (`off`, `false`, `0`) disables it.
    pub fn new(state_dir: &Path) -> Self {
        Self::with_enabled(state_dir, encryption_enabled_from_env())
    }

    pub fn with_enabled(state_dir: &Path, enabled: bool) -> Self {
        Self {
            key_path: state_dir.join(KEY_FILE),
            enabled,
            key: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Encrypt `plaintext`. Identity when disabled, when the input is
    /// already enveloped, or when anything fails underneath.
    pub fn encrypt(&self, plaintext: &str) -> String {
        if !self.enabled || plaintext.starts_with(ENVELOPE_PREFIX) {
            return plaintext.to_string();
        }
        match self.try_encrypt(plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                tracing::warn!("transcript encryption failed, storing plaintext: {e}");
                plaintext.to_string()
            }
        }
    }

    /// Decrypt `data`. Values without the envelope prefix, and malformed
    /// enveloped values, come back unchanged.
    pub fn decrypt(&self, data: &str) -> String {
        if !self.enabled {
            return data.to_string();
        }
        let Some(encoded) = data.strip_prefix(ENVELOPE_PREFIX) else {
            return data.to_string();
        };
        match self.try_decrypt(encoded) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!("transcript decryption failed, returning raw value: {e}");
                data.to_string()
            }
        }
    }

    fn try_encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let key = self.load_or_create_key()?;
        let cipher = TranscriptAead::new(Key::<TranscriptAead>::from_slice(&key));

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        // The AEAD returns ciphertext ‖ tag; the envelope wants iv ‖ tag ‖ ct.
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("AEAD encryption failed"))?;
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + ct.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ct);

        Ok(format!(
            "{ENVELOPE_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(blob)
        ))
    }

    fn try_decrypt(&self, encoded: &str) -> anyhow::Result<String> {
        let blob = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        anyhow::ensure!(blob.len() >= IV_LEN + TAG_LEN, "envelope too short");

        let (iv, rest) = blob.split_at(IV_LEN);
        let (tag, ct) = rest.split_at(TAG_LEN);

        let key = self.load_or_create_key()?;
        let cipher = TranscriptAead::new(Key::<TranscriptAead>::from_slice(&key));

        let mut sealed = Vec::with_capacity(ct.len() + TAG_LEN);
        sealed.extend_from_slice(ct);
        sealed.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_slice())
            .map_err(|_| anyhow::anyhow!("wrong key or tampered ciphertext"))?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Load the key, creating it on first use. Cached for process lifetime.
    fn load_or_create_key(&self) -> anyhow::Result<[u8; KEY_LEN]> {
        let mut cache = self
            .key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(key) = *cache {
            return Ok(key);
        }

        let key = if self.key_path.exists() {
            let bytes = fs::read(&self.key_path)?;
            anyhow::ensure!(
                bytes.len() == KEY_LEN,
                "session key file has wrong length: {}",
                bytes.len()
            );
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            key
        } else {
            let mut key = [0u8; KEY_LEN];
            rand::rngs::OsRng.fill_bytes(&mut key);
            self.write_key_atomically(&key)?;
            key
        };

        *cache = Some(key);
        Ok(key)
    }

    /// Write via temp file + rename so a crash never leaves a partial key.
    fn write_key_atomically(&self, key: &[u8; KEY_LEN]) -> anyhow::Result<()> {
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.key_path.with_extension("tmp");
        fs::write(&tmp, key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, &self.key_path)?;
        Ok(())
    }
}

fn encryption_enabled_from_env() -> bool {
    match std::env::var("SESSION_ENCRYPTION") {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "off" | "false" | "0"),
        Err(_) => true,
    }
}
