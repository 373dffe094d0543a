//! HKDF / HMAC derivation, the AES-256-CBC message cipher and the AES-256-CTR
//! stream used by sealed-sender envelopes.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::KeyError;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// SHA-256 output length.
pub const HASH_OUTPUT_SIZE: usize = 32;

/// AES block size, also the IV length.
pub const AES_BLOCK_SIZE: usize = 16;

/// HKDF-SHA256 extract-and-expand. A missing salt means a zero-filled salt.
pub fn hkdf_sha256(
    input_key_material: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output_length: usize,
) -> Result<Vec<u8>, KeyError> {
    let max = 255 * HASH_OUTPUT_SIZE;
    if output_length > max {
        return Err(KeyError::InvalidLength {
            requested: output_length,
            max,
        });
    }
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut okm = vec![0u8; output_length];
    hkdf.expand(info, &mut okm).map_err(|_| KeyError::InvalidLength {
        requested: output_length,
        max,
    })?;
    Ok(okm)
}

pub fn hmac_sha256(key: &[u8], input: &[u8]) -> [u8; HASH_OUTPUT_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(input);
    mac.finalize().into_bytes().into()
}

pub fn aes_256_cbc_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| KeyError::InvalidCipherInput)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn aes_256_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, KeyError> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(KeyError::InvalidCipherInput);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| KeyError::InvalidCipherInput)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| KeyError::InvalidCipherInput)
}

/// AES-256-CTR from an all-zero counter block. Only safe with a key used for
/// a single message. Encryption and decryption are the same operation.
pub fn aes_256_ctr(data: &[u8], key: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut cipher =
        Aes256Ctr::new_from_slices(key, &[0u8; AES_BLOCK_SIZE]).map_err(|_| KeyError::InvalidCipherInput)?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}
