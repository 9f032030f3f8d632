//! Challenge cipher and pairing key generation
//!
//! The band proves possession of the shared key by asking the client to
//! encrypt a 16-byte random challenge with AES-128 in ECB mode, no padding.
//! A single block is all that is ever encrypted.

use crate::domain::models::{AuthKey, AUTH_KEY_LEN};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;

use super::protocol::CHALLENGE_LEN;

/// Fresh pairing key from the operating system's CSPRNG
pub fn generate_auth_key() -> AuthKey {
    let mut bytes = [0u8; AUTH_KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    AuthKey::from_bytes(bytes)
}

/// Encrypt one challenge block under `key`
pub fn encrypt_challenge(key: &AuthKey, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(challenge);
    cipher.encrypt_block(&mut block);
    to_array(&block)
}

/// Inverse of [`encrypt_challenge`]; the band side of the exchange
pub fn decrypt_challenge(key: &AuthKey, encrypted: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(encrypted);
    cipher.decrypt_block(&mut block);
    to_array(&block)
}

fn to_array(block: &[u8]) -> [u8; CHALLENGE_LEN] {
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(block);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_vector() {
        let key = AuthKey::from_bytes([0u8; 16]);
        let encrypted = encrypt_challenge(&key, &[0u8; 16]);
        assert_eq!(hex::encode(encrypted), "66e94bd4ef8a2c3b884cfa59ca342b2e");
    }

    #[test]
    fn test_fips_197_vector() {
        let key: AuthKey = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let plaintext: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        let encrypted = encrypt_challenge(&key, &plaintext);
        assert_eq!(hex::encode(encrypted), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_round_trip() {
        let key = generate_auth_key();
        let challenge: [u8; 16] = std::array::from_fn(|i| i as u8 + 1);
        let encrypted = encrypt_challenge(&key, &challenge);
        assert_ne!(encrypted, challenge);
        assert_eq!(decrypt_challenge(&key, &encrypted), challenge);
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_auth_key(), generate_auth_key());
    }
}
