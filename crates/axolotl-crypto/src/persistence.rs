//! Encrypted persistence for protocol state.
//!
//! The identity key, pre-keys and every session record are sealed together
//! with a password-derived key (PBKDF2-HMAC-SHA256, AES-256-GCM) and written
//! to disk in one atomic replace.

use std::fs::{self, File};
use std::io::Write;
use std::num::NonZeroU32;
use std::path::Path;

use anyhow::{bail, Context};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

use crate::stores::ProtocolStores;

const MAGIC: &[u8; 4] = b"AXSS"; // "AXolotl Sealed Stores"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// magic(4) version(1) iterations(4) salt(32) nonce(12) length(4)
const HEADER_LEN: usize = 4 + 1 + 4 + SALT_LEN + NONCE_LEN + 4;
const AAD_LEN: usize = 4 + 1 + 4;

pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Derive a 256-bit AES-GCM key from password and salt.
fn derive_key(password: &str, salt: &[u8; SALT_LEN], iterations: u32) -> anyhow::Result<LessSafeKey> {
    let iterations = NonZeroU32::new(iterations).context("zero PBKDF2 iteration count")?;
    let mut key_bytes = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key_bytes,
    );
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| anyhow::anyhow!("invalid key length"));
    zeroize::Zeroize::zeroize(&mut key_bytes);
    Ok(LessSafeKey::new(unbound?))
}

fn aad(iterations: u32) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad[5..].copy_from_slice(&iterations.to_be_bytes());
    aad
}

/// Seal stores into a binary blob for disk storage.
///
/// Format: [AXSS(4)] [version(1)] [iterations(4)] [salt(32)] [nonce(12)] [length(4)] [ciphertext + tag(16)]
pub fn seal_stores(stores: &ProtocolStores, password: &str) -> anyhow::Result<Vec<u8>> {
    seal_stores_with_iterations(stores, password, PBKDF2_ITERATIONS)
}

pub fn seal_stores_with_iterations(
    stores: &ProtocolStores,
    password: &str,
    iterations: u32,
) -> anyhow::Result<Vec<u8>> {
    let rng = SystemRandom::new();

    let plaintext = postcard::to_allocvec(stores).context("serialization failed")?;

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| anyhow::anyhow!("RNG failed"))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow::anyhow!("RNG failed"))?;

    let key = derive_key(password, &salt, iterations)?;
    let mut in_out = plaintext;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    key.seal_in_place_append_tag(nonce, Aad::from(aad(iterations)), &mut in_out)
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;

    let payload_len = u32::try_from(in_out.len()).context("store snapshot too large")?;
    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&iterations.to_be_bytes());
    file_data.extend_from_slice(&salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&in_out);

    Ok(file_data)
}

/// Open a sealed blob.
pub fn open_stores(file_data: &[u8], password: &str) -> anyhow::Result<ProtocolStores> {
    if file_data.len() < HEADER_LEN {
        bail!("file too short");
    }
    if !has_valid_header(file_data) {
        bail!("invalid file format (expected AXSS header)");
    }

    let mut offset = 5;
    let iterations = u32::from_be_bytes(read_array(file_data, &mut offset));
    let salt: [u8; SALT_LEN] = read_array(file_data, &mut offset);
    let nonce_bytes: [u8; NONCE_LEN] = read_array(file_data, &mut offset);
    let payload_len = u32::from_be_bytes(read_array(file_data, &mut offset)) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        bail!("file truncated");
    }

    let key = derive_key(password, &salt, iterations)?;

    let mut ciphertext = file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let plaintext = key
        .open_in_place(nonce, Aad::from(aad(iterations)), &mut ciphertext)
        .map_err(|_| anyhow::anyhow!("incorrect password or corrupted file"))?;

    let stores: ProtocolStores = postcard::from_bytes(plaintext).context("deserialization failed")?;

    Ok(stores)
}

// Callers check the length against HEADER_LEN first.
fn read_array<const N: usize>(data: &[u8], offset: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[*offset..*offset + N]);
    *offset += N;
    out
}

/// Check if file data starts with a valid AXSS header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

/// Seal and write stores, replacing `path` only once the new file is on disk.
pub fn save_to_file(path: &Path, stores: &ProtocolStores, password: &str) -> anyhow::Result<()> {
    let data = seal_stores(stores, password)?;
    write_atomic(path, &data)
}

pub fn load_from_file(path: &Path, password: &str) -> anyhow::Result<ProtocolStores> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    open_stores(&data, password)
}

/// Write `data` to a sibling temp file, fsync it, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file =
            File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    debug!(path = %path.display(), bytes = data.len(), "wrote sealed stores");
    Ok(())
}
