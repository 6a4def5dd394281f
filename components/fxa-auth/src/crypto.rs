/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The onepw key derivation ladder. See
//! https://github.com/mozilla/fxa-auth-server/wiki/onepw-protocol for the
//! protocol walkthrough; all tokens and keys in here are 32 bytes.

use base64;
use hex;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use openssl;
use sha2::{Digest, Sha256};

use errors::*;
use util::Xorable;

pub const KEY_LENGTH: usize = 32;

const HKDF_SALT: [u8; 32] = [0u8; 32];

/// Prefix a key derivation name the way every FxA context info string is
/// built.
pub fn kw(name: &str) -> Vec<u8> {
    format!("identity.mozilla.com/picl/v1/{}", name)
        .as_bytes()
        .to_vec()
}

/// RFC 5869 extract-and-expand with SHA-256. An empty salt is equivalent to
/// `hash_len` zero bytes.
pub fn derive_hkdf_sha256_key(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::extract(salt, ikm);
    hk.expand(info, len)
}

/// The keys derived from a sessionToken. `request_key` is carried along for
/// protocol completeness although nothing in the sync flows needs it.
pub struct SessionTokenKeys {
    pub token_id: Vec<u8>,
    pub req_hmac_key: Vec<u8>,
    pub request_key: Vec<u8>,
}

pub fn derive_session_token(session_token_hex: &str) -> Result<SessionTokenKeys> {
    let token = hex::decode(session_token_hex)?;
    if token.len() != KEY_LENGTH {
        bail!(ErrorKind::BadKeyLength("sessionToken", token.len()));
    }
    let out = derive_hkdf_sha256_key(&token, &HKDF_SALT, &kw("sessionToken"), 3 * KEY_LENGTH);
    Ok(SessionTokenKeys {
        token_id: out[0..KEY_LENGTH].to_vec(),
        req_hmac_key: out[KEY_LENGTH..2 * KEY_LENGTH].to_vec(),
        request_key: out[2 * KEY_LENGTH..3 * KEY_LENGTH].to_vec(),
    })
}

/// The keys derived from a keyFetchToken. `token_id` and `req_hmac_key` sign
/// the HAWK GET to /account/keys; `resp_hmac_key` and `resp_xor_key` unwrap
/// its response.
pub struct KeyFetchTokenKeys {
    pub token_id: Vec<u8>,
    pub req_hmac_key: Vec<u8>,
    pub resp_hmac_key: Vec<u8>,
    pub resp_xor_key: Vec<u8>,
}

pub fn derive_key_fetch_token(key_fetch_token_hex: &str) -> Result<KeyFetchTokenKeys> {
    let token = hex::decode(key_fetch_token_hex)?;
    if token.len() != KEY_LENGTH {
        bail!(ErrorKind::BadKeyLength("keyFetchToken", token.len()));
    }
    let out = derive_hkdf_sha256_key(&token, &HKDF_SALT, &kw("keyFetchToken"), 3 * KEY_LENGTH);
    let key_request_key = &out[2 * KEY_LENGTH..3 * KEY_LENGTH];
    let resp = derive_hkdf_sha256_key(
        key_request_key,
        &HKDF_SALT,
        &kw("account/keys"),
        3 * KEY_LENGTH,
    );
    Ok(KeyFetchTokenKeys {
        token_id: out[0..KEY_LENGTH].to_vec(),
        req_hmac_key: out[KEY_LENGTH..2 * KEY_LENGTH].to_vec(),
        resp_hmac_key: resp[0..KEY_LENGTH].to_vec(),
        resp_xor_key: resp[KEY_LENGTH..3 * KEY_LENGTH].to_vec(),
    })
}

/// Unbundle the /account/keys response: verify its MAC, XOR away the
/// response key, and unwrap kB with unwrapBKey. Returns `(kA, kB)`.
pub fn derive_master_keys(
    bundle_hex: &str,
    resp_hmac_key: &[u8],
    resp_xor_key: &[u8],
    unwrap_kb: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let bundle = hex::decode(bundle_hex)?;
    if bundle.len() != 3 * KEY_LENGTH {
        bail!(ErrorKind::BadKeyLength("bundle", bundle.len()));
    }
    let ciphertext = &bundle[0..2 * KEY_LENGTH];
    let mac_code = &bundle[2 * KEY_LENGTH..3 * KEY_LENGTH];

    let mut mac = Hmac::<Sha256>::new_varkey(resp_hmac_key)
        .map_err(|_| ErrorKind::BadKeyLength("respHMACkey", resp_hmac_key.len()))?;
    mac.input(ciphertext);
    // `verify` compares in constant time. Under no circumstances do we
    // unwrap a bundle whose MAC does not check out.
    if mac.verify(mac_code).is_err() {
        bail!(ErrorKind::HmacMismatch);
    }

    let xored = ciphertext.xored_with(resp_xor_key)?;
    let ka = xored[0..KEY_LENGTH].to_vec();
    let wrap_kb = &xored[KEY_LENGTH..2 * KEY_LENGTH];
    // There is no MAC on wrap(kB) itself.
    let kb = wrap_kb.xored_with(unwrap_kb)?;

    Ok((ka, kb))
}

/// Derive the "oldsync" key material from kB: 64 bytes, AES key first, HMAC
/// key second. Only ever used to decrypt and encrypt the crypto/keys record.
pub fn derive_sync_key(kb: &[u8]) -> Vec<u8> {
    let salt = [0u8; 0];
    derive_hkdf_sha256_key(kb, &salt, &kw("oldsync"), 2 * KEY_LENGTH)
}

/// The X-Client-State header value: the first half of SHA-256(kB), hex.
pub fn client_state(kb: &[u8]) -> String {
    hex::encode(&Sha256::digest(kb)[0..16])
}

/// A 12 character URL-safe sync record id, as used for BSO ids and the
/// client id.
pub fn random_sync_id() -> Result<String> {
    let mut bytes = [0u8; 9];
    openssl::rand::rand_bytes(&mut bytes)?;
    Ok(base64::encode_config(&bytes, base64::URL_SAFE_NO_PAD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = vec![0x0bu8; 22];
        let salt: Vec<u8> = (0x00..0x0d).collect();
        let info: Vec<u8> = (0xf0..0xfa).collect();
        let okm = derive_hkdf_sha256_key(&ikm, &salt, &info, 42);
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf\
             34007208d5b887185865"
        );
    }

    #[test]
    fn test_session_token_split() {
        let keys = derive_session_token(&"11".repeat(32)).unwrap();
        assert_eq!(keys.token_id.len(), 32);
        assert_eq!(keys.req_hmac_key.len(), 32);
        assert_eq!(keys.request_key.len(), 32);
        assert_ne!(keys.token_id, keys.req_hmac_key);
    }

    #[test]
    fn test_session_token_bad_length() {
        assert!(derive_session_token("deadbeef").is_err());
    }

    fn make_bundle(
        ka: &[u8],
        wrap_kb: &[u8],
        resp_hmac_key: &[u8],
        resp_xor_key: &[u8],
    ) -> String {
        let mut plain = ka.to_vec();
        plain.extend_from_slice(wrap_kb);
        let ciphertext = plain.xored_with(resp_xor_key).unwrap();
        let mut mac = Hmac::<Sha256>::new_varkey(resp_hmac_key).unwrap();
        mac.input(&ciphertext);
        let mut bundle = ciphertext;
        bundle.extend_from_slice(&mac.result().code());
        hex::encode(bundle)
    }

    #[test]
    fn test_derive_master_keys() {
        let keys = derive_key_fetch_token(&"22".repeat(32)).unwrap();
        let ka = vec![0xaau8; 32];
        let unwrap_kb = vec![0x33u8; 32];
        let kb = vec![0x5cu8; 32];
        let wrap_kb = kb.xored_with(&unwrap_kb).unwrap();
        let bundle = make_bundle(&ka, &wrap_kb, &keys.resp_hmac_key, &keys.resp_xor_key);

        let (got_ka, got_kb) =
            derive_master_keys(&bundle, &keys.resp_hmac_key, &keys.resp_xor_key, &unwrap_kb)
                .unwrap();
        assert_eq!(got_ka, ka);
        assert_eq!(got_kb, kb);
    }

    #[test]
    fn test_derive_master_keys_bad_mac() {
        let keys = derive_key_fetch_token(&"22".repeat(32)).unwrap();
        let bundle = make_bundle(
            &[0xaau8; 32],
            &[0xbbu8; 32],
            &keys.resp_hmac_key,
            &keys.resp_xor_key,
        );
        // Flip one bit of the MAC.
        let mut tampered = hex::decode(&bundle).unwrap();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        let err = derive_master_keys(
            &hex::encode(tampered),
            &keys.resp_hmac_key,
            &keys.resp_xor_key,
            &[0x33u8; 32],
        ).unwrap_err();
        match *err.kind() {
            ErrorKind::HmacMismatch => {}
            ref kind => panic!("unexpected error kind: {:?}", kind),
        }
    }

    #[test]
    fn test_derive_sync_key_split() {
        let key = derive_sync_key(&[0x5cu8; 32]);
        assert_eq!(key.len(), 64);
        assert_ne!(&key[0..32], &key[32..64]);
    }

    #[test]
    fn test_client_state() {
        let state = client_state(&[0x5cu8; 32]);
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_digit(16)));
    }

    #[test]
    fn test_random_sync_id() {
        let id = random_sync_id().unwrap();
        assert_eq!(id.len(), 12);
        assert_ne!(id, random_sync_id().unwrap());
    }
}
