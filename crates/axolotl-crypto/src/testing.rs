//! Fixed keys and helpers shared by the known-answer tests.

use rand::{CryptoRng, RngCore};

use crate::curve::{KeyPair, PrivateKey};

/// RFC 7748 section 6.1 key pairs.
pub const ALICE_PRIVATE: &str = "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a";
pub const ALICE_PUBLIC: &str = "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a";
pub const BOB_PRIVATE: &str = "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb";
pub const BOB_PUBLIC: &str = "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f";
pub const RFC7748_SHARED: &str = "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742";

/// Identity key of libsignal's Curve25519 signature test.
pub const SIGNER_PRIVATE: &str = "c097248412e58bf05df487968205132794178e367637f5818f81e0e6ce73e865";
pub const SIGNER_PUBLIC: &str = "ab7e717d4a163b7d9a1d8071dfe9dcf8cdcd1cea3339b6356be84d887e322c64";

pub fn from_hex(hex: &str) -> Vec<u8> {
    assert_eq!(hex.len() % 2, 0, "odd hex length");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

pub fn hex32(hex: &str) -> [u8; 32] {
    from_hex(hex).try_into().unwrap()
}

pub fn key_pair(private_hex: &str) -> KeyPair {
    let private_key = PrivateKey::from_bytes(&from_hex(private_hex)).unwrap();
    KeyPair::new(private_key.public_key(), private_key)
}

/// Yields 0, 1, 2, ... so that "random" inputs are reproducible.
pub struct CountingRng(u8);

impl CountingRng {
    pub fn new() -> Self {
        Self(0)
    }
}

impl RngCore for CountingRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for CountingRng {}
