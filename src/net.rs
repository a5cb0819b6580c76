use std::io::{Read, Write};

use anyhow::{bail, Context};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::query::QueryParams;

/// Frames larger than this are refused outright. Shell histories fit in
/// far less.
pub const MAX_FRAME: u32 = 8 * 1024 * 1024;

const NONCE_LEN: usize = 24;

/// One request per connection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Store a batch of history lines under the given provenance.
    Ingest {
        lines: String,
        user: String,
        host: String,
    },
    /// Run a query and return its rendered output.
    Query { params: QueryParams },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Result { output: String },
    Error { message: String },
}

/// Symmetric cipher shared by client and server, keyed with the SHA-256
/// digest of the passphrase. The key bytes are wiped on drop.
pub struct Cipher {
    key: [u8; 32],
}

impl Drop for Cipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl Cipher {
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn aead(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypts `plain` under a fresh random nonce. The nonce is prepended
    /// to the returned bytes.
    pub fn seal(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead()
            .encrypt(XNonce::from_slice(&nonce), plain)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e:?}"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed frame shorter than its nonce");
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed, wrong key or corrupted frame"))
    }
}

/// Writes one sealed message: a 4-byte big-endian length, then the
/// nonce-prefixed ciphertext.
pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    cipher: &Cipher,
    message: &T,
) -> anyhow::Result<()> {
    let plain = serde_json::to_vec(message)?;
    let sealed = cipher.seal(&plain)?;
    let len = u32::try_from(sealed.len()).context("message too large to frame")?;
    if len > MAX_FRAME {
        bail!("message of {len} bytes exceeds the {MAX_FRAME} byte frame cap");
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&sealed)?;
    writer.flush()?;
    Ok(())
}

/// Reads one sealed message written by [`write_message`].
pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
    cipher: &Cipher,
) -> anyhow::Result<T> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        bail!("peer announced a {len} byte frame, cap is {MAX_FRAME}");
    }
    let mut sealed = vec![0u8; len as usize];
    reader.read_exact(&mut sealed)?;
    let plain = cipher.open(&sealed)?;
    Ok(serde_json::from_slice(&plain)?)
}
