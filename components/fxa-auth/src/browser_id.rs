/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! RSA key pairs and BrowserID assertions. A fresh 2048-bit pair is
//! generated for every certificate we ask the FxA server to sign; the
//! assertion then proves to the Token Server that we hold the private key.

use std::fmt;

use base64;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use serde_json;
use url::Url;

use errors::*;
use util;

const RSA_KEY_BITS: u32 = 2048;

pub struct RsaKeyPair {
    key: PKey<Private>,
    n: String,
    e: String,
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<rsa_key_pair>")
    }
}

impl RsaKeyPair {
    /// Generate a new 2048-bit key pair with public exponent 65537.
    pub fn generate() -> Result<RsaKeyPair> {
        let rsa = Rsa::generate(RSA_KEY_BITS)?;
        let n = rsa.n().to_dec_str()?.to_string();
        let e = rsa.e().to_dec_str()?.to_string();
        Ok(RsaKeyPair {
            key: PKey::from_rsa(rsa)?,
            n: n,
            e: e,
        })
    }

    /// The public key in the JSON shape /certificate/sign expects.
    pub fn public_key_json(&self) -> serde_json::Value {
        json!({
            "algorithm": "RS",
            "n": self.n,
            "e": self.e,
        })
    }

    /// PKCS#1 v1.5 signature over SHA-256 of `message`, as unsigned
    /// big-endian bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }
}

/// The audience of an assertion: `scheme://host`, with the port kept only
/// when the URL spells one out.
pub fn audience(url: &str) -> Result<String> {
    let uri = Url::parse(url)?;
    let host = uri.host_str()
        .ok_or_else(|| Error::from(format!("URL has no host: {}", url)))?;
    match uri.port() {
        Some(port) => Ok(format!("{}://{}:{}", uri.scheme(), host, port)),
        None => Ok(format!("{}://{}", uri.scheme(), host)),
    }
}

/// Build the BrowserID assertion
/// `certificate ~ b64url(header).b64url(body).b64url(signature)`.
pub fn create_assertion(
    certificate: &str,
    audience: &str,
    duration_secs: u64,
    key_pair: &RsaKeyPair,
) -> Result<String> {
    let header = json!({"alg": "RS256"});
    let expires_at = util::now() + duration_secs * 1000;
    let body = json!({"exp": expires_at, "aud": audience});
    let header_b64 = base64_urlsafe(header.to_string().as_bytes());
    let body_b64 = base64_urlsafe(body.to_string().as_bytes());
    let to_sign = format!("{}.{}", header_b64, body_b64);
    let signature = key_pair.sign(to_sign.as_bytes())?;
    Ok(format!(
        "{}~{}.{}",
        certificate,
        to_sign,
        base64_urlsafe(&signature)
    ))
}

/// Check that a certificate from /certificate/sign was issued to the
/// signed-in account: `alg` must be RS256 and the principal email must be
/// `<uid>@<fxa host>`.
pub fn verify_certificate(certificate: &str, uid: &str, fxa_host: &str) -> Result<()> {
    let pieces: Vec<&str> = certificate.split('.').collect();
    if pieces.len() < 2 {
        bail!(ErrorKind::CertificateInvalid);
    }
    let header = base64::decode_config(pieces[0], base64::URL_SAFE_NO_PAD)?;
    let payload = base64::decode_config(pieces[1], base64::URL_SAFE_NO_PAD)?;

    let header: serde_json::Value = serde_json::from_slice(&header)?;
    match header["alg"].as_str() {
        Some("RS256") => {}
        Some(alg) => {
            warn!("Expected algorithm RS256, found {}", alg);
            bail!(ErrorKind::CertificateInvalid);
        }
        None => bail!(ErrorKind::CertificateInvalid),
    }

    let payload: serde_json::Value = serde_json::from_slice(&payload)?;
    let email = payload["principal"]["email"]
        .as_str()
        .ok_or_else(|| Error::from(ErrorKind::CertificateInvalid))?;
    let expected = format!("{}@{}", uid, fxa_host);
    if email != expected {
        warn!("Certificate principal {} does not match {}", email, expected);
        bail!(ErrorKind::CertificateInvalid);
    }
    Ok(())
}

fn base64_urlsafe(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_certificate(email: &str) -> String {
        let header = base64_urlsafe(b"{\"alg\": \"RS256\"}");
        let payload = base64_urlsafe(
            json!({"principal": {"email": email}}).to_string().as_bytes(),
        );
        format!("{}.{}.c2lnbmF0dXJl", header, payload)
    }

    #[test]
    fn test_audience() {
        assert_eq!(
            audience("https://token.services.mozilla.com/1.0/sync/1.5").unwrap(),
            "https://token.services.mozilla.com"
        );
        assert_eq!(
            audience("http://localhost:5000/token/1.0/sync/1.5").unwrap(),
            "http://localhost:5000"
        );
    }

    #[test]
    fn test_verify_certificate() {
        let uid = "0123456789abcdef";
        let cert = fake_certificate(&format!("{}@api.accounts.firefox.com", uid));
        assert!(verify_certificate(&cert, uid, "api.accounts.firefox.com").is_ok());
        assert!(verify_certificate(&cert, "someone-else", "api.accounts.firefox.com").is_err());
        assert!(verify_certificate(&cert, uid, "evil.example.com").is_err());
    }

    #[test]
    fn test_verify_certificate_bad_alg() {
        let header = base64_urlsafe(b"{\"alg\": \"HS256\"}");
        let payload = base64_urlsafe(
            json!({"principal": {"email": "a@b"}}).to_string().as_bytes(),
        );
        let cert = format!("{}.{}.sig", header, payload);
        assert!(verify_certificate(&cert, "a", "b").is_err());
    }

    #[test]
    fn test_create_assertion_shape() {
        let key_pair = RsaKeyPair::generate().unwrap();
        let assertion =
            create_assertion("CERTIFICATE", "https://example.com", 300, &key_pair).unwrap();
        assert!(assertion.starts_with("CERTIFICATE~"));
        let jwt = assertion.split('~').nth(1).unwrap();
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[test]
    fn test_signature_width() {
        let key_pair = RsaKeyPair::generate().unwrap();
        let signature = key_pair.sign(b"message").unwrap();
        assert_eq!(signature.len(), 256);
    }
}
