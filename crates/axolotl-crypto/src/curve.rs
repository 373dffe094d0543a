//! Curve25519 key pairs, Diffie-Hellman agreement and XEdDSA signatures.
//!
//! The same Montgomery-form key is used for agreement and, through its
//! birationally equivalent Edwards point, for signing signed pre-keys.

use std::fmt;

use axolotl_protocol::codec::{self, PUBLIC_KEY_LENGTH, SERIALIZED_PUBLIC_KEY_LENGTH};
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyError;

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// A Curve25519 public key (Montgomery u-coordinate).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_raw(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a raw 32-byte key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("public key must be 32 bytes"))?;
        Ok(Self(raw))
    }

    /// Parse the type-prefixed wire form.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, KeyError> {
        codec::decode_point(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey("bad serialized public key"))
    }

    /// The type-prefixed wire form.
    pub fn serialize(&self) -> [u8; SERIALIZED_PUBLIC_KEY_LENGTH] {
        codec::encode_point(&self.0)
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn fingerprint(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Verify an XEdDSA signature made by the matching private key.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = <&[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };

        let mont_point = MontgomeryPoint(self.0);
        let Some(ed_public_point) = mont_point.to_edwards((signature[63] & 0b1000_0000) >> 7) else {
            return false;
        };
        let cap_a = ed_public_point.compress();

        let mut cap_r = [0u8; 32];
        cap_r.copy_from_slice(&signature[..32]);
        let mut s = [0u8; 32];
        s.copy_from_slice(&signature[32..]);
        s[31] &= 0b0111_1111;
        if (s[31] & 0b1110_0000) != 0 {
            return false;
        }

        let h = hash_to_scalar(&[&cap_r, cap_a.as_bytes(), message]);
        let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
            &h,
            &-ed_public_point,
            &Scalar::from_bytes_mod_order(s),
        )
        .compress();

        bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// A clamped Curve25519 scalar. Wiped from memory on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_LENGTH]);

impl PrivateKey {
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        rng.fill_bytes(&mut bytes);
        let key = Self(clamp(bytes));
        bytes.zeroize();
        key
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; PRIVATE_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("private key must be 32 bytes"))?;
        Ok(Self(clamp(raw)))
    }

    pub fn serialize(&self) -> &[u8; PRIVATE_KEY_LENGTH] {
        &self.0
    }

    /// Fixed-base scalar multiplication.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// X25519 agreement. Rejects low-order points, whose output would be
    /// independent of our private key.
    pub fn calculate_agreement(&self, their_key: &PublicKey) -> Result<[u8; 32], KeyError> {
        let secret = StaticSecret::from(self.0);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(their_key.0));
        if !shared.was_contributory() {
            return Err(KeyError::InvalidKey("low-order public key"));
        }
        Ok(shared.to_bytes())
    }

    /// XEdDSA signature over `message`.
    pub fn calculate_signature<R: CryptoRng + RngCore>(
        &self,
        message: &[u8],
        rng: &mut R,
    ) -> [u8; SIGNATURE_LENGTH] {
        let mut random = [0u8; 64];
        rng.fill_bytes(&mut random);

        let a = Scalar::from_bytes_mod_order(self.0);
        let ed_public_key = EdwardsPoint::mul_base(&a).compress();
        let sign_bit = ed_public_key.as_bytes()[31] & 0b1000_0000;

        let mut prefix = [0xFFu8; 32];
        prefix[0] = 0xFE;
        let r = hash_to_scalar(&[&prefix, &self.0, message, &random]);
        let cap_r = EdwardsPoint::mul_base(&r).compress();

        let h = hash_to_scalar(&[cap_r.as_bytes(), ed_public_key.as_bytes(), message]);
        let s = (h * a) + r;

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..32].copy_from_slice(cap_r.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        signature[63] &= 0b0111_1111;
        signature[63] |= sign_bit;

        random.zeroize();
        signature
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// A public key together with its private half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let private_key = PrivateKey::generate(rng);
        Self {
            public_key: private_key.public_key(),
            private_key,
        }
    }

    pub fn new(public_key: PublicKey, private_key: PrivateKey) -> Self {
        Self {
            public_key,
            private_key,
        }
    }

    /// Rebuild a pair from stored bytes, checking the halves belong together.
    pub fn from_public_and_private(public_key: &[u8], private_key: &[u8]) -> Result<Self, KeyError> {
        let public_key = PublicKey::from_bytes(public_key)?;
        let private_key = PrivateKey::from_bytes(private_key)?;
        if private_key.public_key() != public_key {
            return Err(KeyError::InvalidKey("public key does not match private key"));
        }
        Ok(Self {
            public_key,
            private_key,
        })
    }

    pub fn calculate_agreement(&self, their_key: &PublicKey) -> Result<[u8; 32], KeyError> {
        self.private_key.calculate_agreement(their_key)
    }

    pub fn calculate_signature<R: CryptoRng + RngCore>(
        &self,
        message: &[u8],
        rng: &mut R,
    ) -> [u8; SIGNATURE_LENGTH] {
        self.private_key.calculate_signature(message, rng)
    }
}

fn clamp(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    bytes
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}
