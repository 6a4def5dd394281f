/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use base64;
use fxa_auth;
use hex;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::{self, symm};

use error::{Error, ErrorKind, Result};

/// A pair of 32-byte keys: one for AES-256-CBC over record payloads, one for
/// the HMAC that authenticates them.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct KeyBundle {
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl KeyBundle {
    /// Construct a key bundle from the already-decoded encrypt and hmac keys.
    pub fn new(enc: Vec<u8>, mac: Vec<u8>) -> Result<KeyBundle> {
        if enc.len() != 32 {
            return Err(ErrorKind::BadKeyLength("enc_key", enc.len()).into());
        }
        if mac.len() != 32 {
            return Err(ErrorKind::BadKeyLength("mac_key", mac.len()).into());
        }
        Ok(KeyBundle {
            enc_key: enc,
            mac_key: mac,
        })
    }

    pub fn new_random() -> Result<KeyBundle> {
        let mut buffer = [0u8; 64];
        openssl::rand::rand_bytes(&mut buffer)?;
        KeyBundle::from_ksync_bytes(&buffer)
    }

    pub fn from_ksync_bytes(ksync: &[u8]) -> Result<KeyBundle> {
        if ksync.len() != 64 {
            return Err(ErrorKind::BadKeyLength("kSync", ksync.len()).into());
        }
        Ok(KeyBundle {
            enc_key: ksync[0..32].into(),
            mac_key: ksync[32..64].into(),
        })
    }

    /// The master bundle: derived from kB, used only for the crypto/keys
    /// record.
    pub fn from_master_key(kb: &[u8]) -> Result<KeyBundle> {
        if kb.len() != 32 {
            return Err(ErrorKind::BadKeyLength("kB", kb.len()).into());
        }
        KeyBundle::from_ksync_bytes(&fxa_auth::crypto::derive_sync_key(kb))
    }

    /// Per-collection bundles arrive as two standard-base64 strings inside
    /// the decrypted crypto/keys record.
    pub fn from_base64(enc: &str, mac: &str) -> Result<KeyBundle> {
        let enc_bytes = base64::decode(enc)?;
        let mac_bytes = base64::decode(mac)?;
        KeyBundle::new(enc_bytes, mac_bytes)
    }

    pub fn to_b64_array(&self) -> [String; 2] {
        [base64::encode(&self.enc_key), base64::encode(&self.mac_key)]
    }

    #[inline]
    pub fn encryption_key(&self) -> &[u8] {
        &self.enc_key
    }

    #[inline]
    pub fn hmac_key(&self) -> &[u8] {
        &self.mac_key
    }

    /// Returns the 32 byte digest by value since it's small enough to be passed
    /// around cheaply, and easily convertable into a slice or vec if you want.
    fn hmac(&self, data: &[u8]) -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        let key = PKey::hmac(self.hmac_key())?;
        let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
        signer.update(data)?;
        let size = signer.sign(&mut out)?;
        if size != 32 {
            return Err(Error::from(ErrorKind::UnexpectedError(
                "SHA256 HMAC was not 32 bytes long".into(),
            )));
        }
        Ok(out)
    }

    /// The payload `hmac` field: hex of the HMAC computed over the *base64
    /// text* of the ciphertext, which is the on-server convention.
    pub fn hmac_string(&self, ciphertext_base64: &str) -> Result<String> {
        Ok(hex::encode(&self.hmac(ciphertext_base64.as_bytes())?))
    }

    /// Constant-time check of a payload's hex `hmac` field.
    pub fn verify_hmac_string(&self, expected_hex: &str, ciphertext_base64: &str) -> Result<bool> {
        let expected = match hex::decode(expected_hex) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        if expected.len() != 32 {
            return Ok(false);
        }
        let computed = self.hmac(ciphertext_base64.as_bytes())?;
        // The rust-openssl docs want us to use this over == to avoid
        // sidechannels, and who am I to argue?
        Ok(openssl::memcmp::eq(&expected, &computed))
    }

    /// Decrypt the provided ciphertext with the given iv, and decode the
    /// result as a utf8 string. Important: caller must check the HMAC first!
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<String> {
        let cleartext_bytes = symm::decrypt(
            symm::Cipher::aes_256_cbc(),
            self.encryption_key(),
            Some(iv),
            ciphertext,
        )?;
        let cleartext = String::from_utf8(cleartext_bytes)?;
        Ok(cleartext)
    }

    /// Encrypt using the provided IV.
    pub fn encrypt_bytes_with_iv(&self, cleartext_bytes: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = symm::encrypt(
            symm::Cipher::aes_256_cbc(),
            self.encryption_key(),
            Some(iv),
            cleartext_bytes,
        )?;
        Ok(ciphertext)
    }

    /// Generate a random iv and encrypt with it. Return both the encrypted bytes
    /// and the generated iv.
    pub fn encrypt_bytes_rand_iv(&self, cleartext_bytes: &[u8]) -> Result<(Vec<u8>, [u8; 16])> {
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;
        let ciphertext = self.encrypt_bytes_with_iv(cleartext_bytes, &iv)?;
        Ok((ciphertext, iv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let bundle = KeyBundle::new_random().unwrap();
        let cleartext = "{\"id\": \"deadbeef\", \"histUri\": \"https://example.com\"}";
        let (ciphertext, iv) = bundle.encrypt_bytes_rand_iv(cleartext.as_bytes()).unwrap();
        assert_ne!(&ciphertext[..], cleartext.as_bytes());
        assert_eq!(bundle.decrypt(&ciphertext, &iv).unwrap(), cleartext);
    }

    #[test]
    fn test_encrypt_is_deterministic_given_iv() {
        let bundle = KeyBundle::new(vec![0u8; 32], vec![1u8; 32]).unwrap();
        let iv = [2u8; 16];
        let first = bundle.encrypt_bytes_with_iv(b"{\"a\":1}", &iv).unwrap();
        let second = bundle.encrypt_bytes_with_iv(b"{\"a\":1}", &iv).unwrap();
        assert_eq!(first, second);
        assert_eq!(bundle.decrypt(&first, &iv).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_padding_roundtrip_all_block_offsets() {
        let bundle = KeyBundle::new_random().unwrap();
        // Cover every padding length at least twice.
        for len in 0..48 {
            let cleartext = "x".repeat(len);
            let (ciphertext, iv) = bundle.encrypt_bytes_rand_iv(cleartext.as_bytes()).unwrap();
            // CBC with PKCS#7 always pads to the next whole block.
            assert_eq!(ciphertext.len() % 16, 0);
            assert!(ciphertext.len() > len);
            assert_eq!(bundle.decrypt(&ciphertext, &iv).unwrap(), cleartext);
        }
    }

    #[test]
    fn test_hmac_over_base64_text() {
        let bundle = KeyBundle::new_random().unwrap();
        let ciphertext_b64 = base64::encode(b"not really ciphertext");
        let hmac = bundle.hmac_string(&ciphertext_b64).unwrap();
        assert_eq!(hmac.len(), 64);
        assert!(bundle.verify_hmac_string(&hmac, &ciphertext_b64).unwrap());
        assert!(!bundle.verify_hmac_string(&hmac, "tampered").unwrap());
        assert!(!bundle.verify_hmac_string("junk-not-hex", &ciphertext_b64).unwrap());
    }

    #[test]
    fn test_from_master_key_is_stable() {
        let kb = vec![0x5cu8; 32];
        let a = KeyBundle::from_master_key(&kb).unwrap();
        let b = KeyBundle::from_master_key(&kb).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.encryption_key(), a.hmac_key());
    }

    #[test]
    fn test_b64_array_roundtrip() {
        let bundle = KeyBundle::new_random().unwrap();
        let arr = bundle.to_b64_array();
        let again = KeyBundle::from_base64(&arr[0], &arr[1]).unwrap();
        assert_eq!(bundle, again);
    }

    #[test]
    fn test_bad_lengths() {
        assert!(KeyBundle::new(vec![0u8; 16], vec![0u8; 32]).is_err());
        assert!(KeyBundle::from_ksync_bytes(&[0u8; 63]).is_err());
        assert!(KeyBundle::from_master_key(&[0u8; 16]).is_err());
    }
}
