/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! HAWK v1 header construction, as required by both the FxA auth server and
//! the Sync 1.5 storage servers.

use base64;
use hex;
use hmac::{Hmac, Mac};
use openssl;
use sha2::{Digest, Sha256};
use url::Url;

use errors::*;
use util;

const HAWK_VERSION: u8 = 1;
const NONCE_LEN: usize = 6;

/// Caller-supplied extras for a header. Everything defaults to absent; a
/// fixed `nonce`/`timestamp` pair makes the header deterministic, which the
/// tests rely on.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub app: Option<String>,
    pub dlg: Option<String>,
    pub ext: Option<String>,
    pub content_type: Option<String>,
    pub hash: Option<String>,
    pub local_time_offset: Option<i64>,
    pub nonce: Option<String>,
    pub payload: Option<String>,
    pub timestamp: Option<i64>,
}

impl Options {
    pub fn with_payload(payload: &str, content_type: &str) -> Options {
        Options {
            payload: Some(payload.to_string()),
            content_type: Some(content_type.to_string()),
            ..Options::default()
        }
    }
}

/// The pieces that went into the MAC, kept around so callers and tests can
/// inspect what was signed.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub app: Option<String>,
    pub dlg: Option<String>,
    pub ext: Option<String>,
    pub hash: Option<String>,
    pub host: String,
    pub method: String,
    pub nonce: String,
    pub port: u16,
    pub resource: String,
    pub ts: i64,
}

#[derive(Debug)]
pub struct Header {
    pub value: String,
    pub artifacts: Artifacts,
}

/// Build the value of an `Authorization: Hawk …` header for `method url`,
/// MACed with `(id, key)`.
pub fn header(
    url: &str,
    method: &str,
    id: &str,
    key: &[u8],
    options: Option<Options>,
) -> Result<Header> {
    let options = options.unwrap_or_default();
    let uri = Url::parse(url)?;
    let host = uri.host_str()
        .ok_or_else(|| Error::from(format!("URL has no host: {}", url)))?
        .to_string();
    let port = uri.port_or_known_default()
        .ok_or_else(|| Error::from(format!("URL has no known port: {}", url)))?;
    let resource = match uri.query() {
        None => uri.path().to_string(),
        Some(query) => format!("{}?{}", uri.path(), query),
    };

    let ts = match options.timestamp {
        Some(timestamp) => timestamp + options.local_time_offset.unwrap_or(0),
        None => util::now_secs() as i64,
    };

    let nonce = match options.nonce {
        Some(ref nonce) => nonce.clone(),
        None => {
            let mut bytes = [0u8; NONCE_LEN / 2];
            openssl::rand::rand_bytes(&mut bytes)?;
            hex::encode(bytes)
        }
    };

    let hash = match options.hash {
        Some(ref hash) => Some(hash.clone()),
        None => match options.payload {
            Some(ref payload) => {
                let content_type = options
                    .content_type
                    .as_ref()
                    .map(|s| s.as_str())
                    .unwrap_or("text/plain");
                Some(payload_hash(payload, content_type))
            }
            None => None,
        },
    };

    let artifacts = Artifacts {
        app: options.app,
        dlg: options.dlg,
        ext: options.ext,
        hash: hash,
        host: host,
        method: method.to_string(),
        nonce: nonce,
        port: port,
        resource: resource,
        ts: ts,
    };

    let mac = compute_mac("header", key, &artifacts)?;

    let mut value = format!(
        "Hawk id=\"{}\", ts=\"{}\", nonce=\"{}\"",
        id, artifacts.ts, artifacts.nonce
    );
    if let Some(ref hash) = artifacts.hash {
        if !hash.is_empty() {
            append_field(&mut value, "hash", hash);
        }
    }
    if let Some(ref ext) = artifacts.ext {
        if !ext.is_empty() {
            append_field(&mut value, "ext", &escape_ext(ext));
        }
    }
    append_field(&mut value, "mac", &mac);
    if let Some(ref app) = artifacts.app {
        append_field(&mut value, "app", app);
        if let Some(ref dlg) = artifacts.dlg {
            append_field(&mut value, "dlg", dlg);
        }
    }

    Ok(Header {
        value: value,
        artifacts: artifacts,
    })
}

/// `base64(SHA256("hawk.1.payload\n<content type>\n<payload>\n"))`. Only the
/// media type before any `;` parameter counts, lowercased.
pub fn payload_hash(payload: &str, content_type: &str) -> String {
    let content = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let update = format!("hawk.{}.payload\n{}\n{}\n", HAWK_VERSION, content, payload);
    base64::encode(&Sha256::digest(update.as_bytes()))
}

fn append_field(header: &mut String, name: &str, value: &str) {
    header.push_str(", ");
    header.push_str(name);
    header.push_str("=\"");
    header.push_str(value);
    header.push('"');
}

fn escape_ext(ext: &str) -> String {
    ext.replace("\\", "\\\\").replace("\n", "\\n")
}

fn normalized_string(mac_type: &str, artifacts: &Artifacts) -> String {
    let mut normalized = format!(
        "hawk.{}.{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        HAWK_VERSION,
        mac_type,
        artifacts.ts,
        artifacts.nonce,
        artifacts.method.to_uppercase(),
        artifacts.resource,
        artifacts.host.to_lowercase(),
        artifacts.port,
        artifacts.hash.as_ref().map(|s| s.as_str()).unwrap_or("")
    );
    match artifacts.ext {
        Some(ref ext) if !ext.is_empty() => normalized.push_str(&escape_ext(ext)),
        _ => {}
    }
    normalized.push('\n');
    if let Some(ref app) = artifacts.app {
        normalized.push_str(app);
        normalized.push('\n');
        if let Some(ref dlg) = artifacts.dlg {
            normalized.push_str(dlg);
            normalized.push('\n');
        }
    }
    normalized
}

fn compute_mac(mac_type: &str, key: &[u8], artifacts: &Artifacts) -> Result<String> {
    let normalized = normalized_string(mac_type, artifacts);
    let mut mac = Hmac::<Sha256>::new_varkey(key)
        .map_err(|_| ErrorKind::BadKeyLength("hawk key", key.len()))?;
    mac.input(normalized.as_bytes());
    Ok(base64::encode(&mac.result().code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_options() -> Options {
        Options {
            nonce: Some("abcdef".to_string()),
            timestamp: Some(1_500_000_000),
            ..Options::default()
        }
    }

    #[test]
    fn test_nonce_is_six_hex_chars() {
        let header = header(
            "https://api.accounts.firefox.com/v1/account/keys",
            "GET",
            "deadbeef",
            b"key",
            None,
        ).unwrap();
        assert_eq!(header.artifacts.nonce.len(), 6);
        assert!(header.artifacts.nonce.chars().all(|c| c.is_digit(16)));
    }

    #[test]
    fn test_header_shape() {
        let header = header(
            "https://example.com/resource/1?b=1&a=2",
            "get",
            "test-id",
            b"test-key",
            Some(fixed_options()),
        ).unwrap();
        assert!(header.value.starts_with(
            "Hawk id=\"test-id\", ts=\"1500000000\", nonce=\"abcdef\", mac=\""
        ));
        assert_eq!(header.artifacts.resource, "/resource/1?b=1&a=2");
        assert_eq!(header.artifacts.host, "example.com");
        assert_eq!(header.artifacts.port, 443);
    }

    #[test]
    fn test_header_is_deterministic_with_fixed_inputs() {
        let make = || {
            header(
                "https://example.com/storage/history",
                "PUT",
                "id",
                b"storage-key",
                Some(Options {
                    payload: Some("{\"a\": 1}".to_string()),
                    content_type: Some("application/json; charset=utf-8".to_string()),
                    ..fixed_options()
                }),
            ).unwrap()
        };
        assert_eq!(make().value, make().value);
    }

    #[test]
    fn test_mac_depends_on_nonce() {
        let make = |nonce: &str| {
            header(
                "https://example.com/resource",
                "GET",
                "id",
                b"key",
                Some(Options {
                    nonce: Some(nonce.to_string()),
                    timestamp: Some(1_500_000_000),
                    ..Options::default()
                }),
            ).unwrap()
            .value
        };
        assert_ne!(make("aaaaaa"), make("bbbbbb"));
    }

    #[test]
    fn test_explicit_port_and_local_time_offset() {
        let header = header(
            "http://localhost:5000/storage/meta/global",
            "GET",
            "id",
            b"key",
            Some(Options {
                timestamp: Some(100),
                local_time_offset: Some(13),
                nonce: Some("aaaaaa".to_string()),
                ..Options::default()
            }),
        ).unwrap();
        assert_eq!(header.artifacts.port, 5000);
        assert_eq!(header.artifacts.ts, 113);
    }

    #[test]
    fn test_payload_hash_content_type_params_ignored() {
        assert_eq!(
            payload_hash("{}", "application/json; charset=utf-8"),
            payload_hash("{}", "APPLICATION/JSON")
        );
        assert_ne!(
            payload_hash("{}", "application/json"),
            payload_hash("{}", "text/plain")
        );
    }

    #[test]
    fn test_normalized_string_layout() {
        let artifacts = Artifacts {
            app: None,
            dlg: None,
            ext: Some("some\\data\nhere".to_string()),
            hash: Some("HASH".to_string()),
            host: "Example.COM".to_string(),
            method: "get".to_string(),
            nonce: "abcdef".to_string(),
            port: 8000,
            resource: "/r?a=1".to_string(),
            ts: 1353832234,
        };
        assert_eq!(
            normalized_string("header", &artifacts),
            "hawk.1.header\n1353832234\nabcdef\nGET\n/r?a=1\nexample.com\n8000\nHASH\n\
             some\\\\data\\nhere\n"
        );
    }

    #[test]
    fn test_normalized_string_app_dlg() {
        let artifacts = Artifacts {
            app: Some("app-id".to_string()),
            dlg: Some("dlg-id".to_string()),
            ext: None,
            hash: None,
            host: "example.com".to_string(),
            method: "POST".to_string(),
            nonce: "abcdef".to_string(),
            port: 443,
            resource: "/r".to_string(),
            ts: 1,
        };
        assert_eq!(
            normalized_string("header", &artifacts),
            "hawk.1.header\n1\nabcdef\nPOST\n/r\nexample.com\n443\n\n\napp-id\ndlg-id\n"
        );
    }
}
