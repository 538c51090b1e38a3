//! Decryption adapters — translate a desired plaintext byte range into the
//! corresponding ciphertext range, fetch it, and decrypt in place.
//!
//! Both adapters are side-effect-free except for delegating to the supplied
//! `Fetch` closure; fetch failures are forwarded unchanged to the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use aes::Aes256;
use bytes::Bytes;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit as CbcKeyIvInit};
use ctr::cipher::{KeyIvInit as CtrKeyIvInit, StreamCipher, StreamCipherSeek};
use scrypt::Params;
use sha2::{Digest, Sha256};

use crate::error::{ReaderError, Result};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK_SIZE: u64 = 16;

/// Fetches a ciphertext byte range `[start, end]` (inclusive) from the
/// underlying segment-range/downloader stack.
pub type Fetch =
    Arc<dyn Fn(u64, u64) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send>> + Send + Sync>;

/// scrypt parameters for password-derived keys. `log_n = 15` (N = 32768)
/// matches the cost moonfire-nvr budgets for its own scrypt use.
fn scrypt_params() -> Params {
    Params::new(15, 8, 1, 32).expect("static scrypt params are valid")
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params(), &mut key)
        .map_err(|e| ReaderError::DataCorruption { reason: format!("key derivation failed: {e}") })?;
    Ok(key)
}

/// Derives a 16-byte stream-cipher IV from the salt. There is no separate
/// IV stored alongside a password-derived descriptor, so the IV must be a
/// deterministic function of the salt alone.
fn derive_iv(salt: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(salt);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

/// Password-derived decryption: scrypt(password, salt) feeds an AES-256-CTR
/// keystream. CTR has no block-alignment requirement — the keystream can be
/// seeked to any byte offset — so the ciphertext range fetched is exactly
/// `[range_start, range_end]`, with no additional framing.
pub async fn open_password_derived(
    password: &str,
    salt: &[u8],
    range_start: u64,
    range_end: u64,
    fetch: Fetch,
) -> Result<Bytes> {
    if range_end < range_start {
        return Ok(Bytes::new());
    }
    let key = derive_key(password, salt)?;
    let iv = derive_iv(salt);

    let ciphertext = fetch(range_start, range_end).await?;
    let mut buf = ciphertext.to_vec();

    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher
        .try_seek(range_start)
        .map_err(|e| ReaderError::DataCorruption { reason: format!("ctr seek failed: {e}") })?;
    cipher.apply_keystream(&mut buf);

    Ok(Bytes::from(buf))
}

/// AES-CBC decryption with a raw key and IV: the fetched window is the
/// smallest 16-byte-aligned ciphertext range enclosing `[range_start,
/// range_end]`. When that range does not start at file offset 0, the
/// preceding ciphertext block is fetched too and used in place of the
/// stored IV (standard CBC chaining), then discarded after decryption.
pub async fn open_aes_cbc(
    key: &[u8],
    iv: &[u8],
    range_start: u64,
    range_end: u64,
    fetch: Fetch,
) -> Result<Bytes> {
    if range_end < range_start {
        return Ok(Bytes::new());
    }

    let aligned_start = (range_start / BLOCK_SIZE) * BLOCK_SIZE;
    let aligned_end_excl = ((range_end + 1) + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
    let needs_prev_block = aligned_start > 0;
    let fetch_start = if needs_prev_block { aligned_start - BLOCK_SIZE } else { 0 };

    let ciphertext = fetch(fetch_start, aligned_end_excl - 1).await?;

    let (chain_iv, data): (&[u8], &[u8]) = if needs_prev_block {
        if ciphertext.len() < BLOCK_SIZE as usize {
            return Err(ReaderError::DataCorruption {
                reason: "ciphertext window shorter than one cipher block".into(),
            });
        }
        (&ciphertext[..BLOCK_SIZE as usize], &ciphertext[BLOCK_SIZE as usize..])
    } else {
        (iv, &ciphertext[..])
    };

    let mut buf = data.to_vec();
    let decryptor = Aes256CbcDec::new_from_slices(key, chain_iv)
        .map_err(|e| ReaderError::DataCorruption { reason: format!("invalid key/iv: {e}") })?;
    let plaintext = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| ReaderError::DataCorruption { reason: format!("cbc decrypt failed: {e}") })?;

    let trim_front = (range_start - aligned_start) as usize;
    let trim_len = (range_end - range_start + 1) as usize;
    if trim_front + trim_len > plaintext.len() {
        return Err(ReaderError::DataCorruption {
            reason: "decrypted window shorter than requested range".into(),
        });
    }

    Ok(Bytes::copy_from_slice(&plaintext[trim_front..trim_front + trim_len]))
}
