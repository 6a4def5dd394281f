/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The handful of FxA auth server endpoints the sync core talks to. Every
//! request is HAWK-signed with keys derived from a session or key-fetch
//! token.

use std::io::Read;

use hex;
use reqwest::{header, Client as ReqwestClient, Method, Request, Response};
use serde_json;
use url::Url;

use config::Config;
use crypto;
use errors::*;
use hawk;
use RsaKeyPair;

const CONTENT_TYPE_JSON: &'static str = "application/json; charset=utf-8";

/// Milliseconds; the FxA server caps certificate validity at 24 hours.
const CERTIFICATE_DURATION_MS: u64 = 60 * 60 * 1000;

pub struct Client<'a> {
    config: &'a Config,
}

impl<'a> Client<'a> {
    pub fn new(config: &'a Config) -> Client<'a> {
        Client { config: config }
    }

    /// GET /account/keys with keyFetchToken-derived credentials. Returns the
    /// 96-byte hex `bundle`; unwrap it with `crypto::derive_master_keys`.
    /// Errno 104 (account not verified) surfaces as a `RemoteError` so the
    /// caller can poll.
    pub fn account_keys(&self, key_fetch_token_hex: &str) -> Result<String> {
        let keys = crypto::derive_key_fetch_token(key_fetch_token_hex)?;
        let url = self.config.auth_url_path("account/keys")?;
        let request = HawkRequestBuilder::new(
            Method::Get,
            url,
            hex::encode(&keys.token_id),
            keys.req_hmac_key.clone(),
        ).build()?;
        let json: serde_json::Value = Client::make_request(request)?.json()?;
        match json["bundle"].as_str() {
            Some(bundle) => Ok(bundle.to_string()),
            None => bail!("Missing 'bundle' member in /account/keys response"),
        }
    }

    /// POST /certificate/sign with sessionToken-derived credentials; the
    /// server signs our freshly generated RSA public key and returns the
    /// certificate used to mint BrowserID assertions.
    pub fn sign_certificate(
        &self,
        session_token_hex: &str,
        key_pair: &RsaKeyPair,
    ) -> Result<String> {
        let keys = crypto::derive_session_token(session_token_hex)?;
        let url = self.config.auth_url_path("certificate/sign")?;
        let body = json!({
            "publicKey": key_pair.public_key_json(),
            "duration": CERTIFICATE_DURATION_MS,
        });
        let request = HawkRequestBuilder::new(
            Method::Post,
            url,
            hex::encode(&keys.token_id),
            keys.req_hmac_key.clone(),
        ).body(body)
            .build()?;
        let json: serde_json::Value = Client::make_request(request)?.json()?;
        match json["cert"].as_str() {
            Some(cert) => Ok(cert.to_string()),
            None => bail!("Missing 'cert' member in /certificate/sign response"),
        }
    }

    /// POST /session/destroy. The session token is useless afterwards.
    pub fn destroy_session(&self, session_token_hex: &str) -> Result<()> {
        let keys = crypto::derive_session_token(session_token_hex)?;
        let url = self.config.auth_url_path("session/destroy")?;
        let request = HawkRequestBuilder::new(
            Method::Post,
            url,
            hex::encode(&keys.token_id),
            keys.req_hmac_key.clone(),
        ).body(json!({}))
            .build()?;
        Client::make_request(request)?;
        Ok(())
    }

    /// The host name assertions and certificates are checked against.
    pub fn auth_host(&self) -> Result<String> {
        let url = self.config.auth_url()?;
        match url.host_str() {
            Some(host) => Ok(host.to_string()),
            None => bail!("Auth URL has no host"),
        }
    }

    fn make_request(request: Request) -> Result<Response> {
        let client = ReqwestClient::new();
        let mut resp = client.execute(request)?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp);
        }

        let mut body = String::new();
        resp.read_to_string(&mut body)?;
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => bail!(ErrorKind::RemoteError(
                json["code"].as_u64().unwrap_or(0),
                json["errno"].as_u64().unwrap_or(0),
                json["error"].as_str().unwrap_or("").to_string(),
                json["message"].as_str().unwrap_or("").to_string(),
            )),
            Err(_) => {
                warn!("Non-JSON error response from FxA server: {}", body);
                bail!(ErrorKind::RemoteError(
                    status.as_u16() as u64,
                    0,
                    status.to_string(),
                    body,
                ))
            }
        }
    }
}

/// Builds a HAWK-signed `reqwest::Request` against an FxA endpoint. Bodies
/// are always `application/json; charset=utf-8` and folded into the payload
/// hash.
pub struct HawkRequestBuilder {
    url: Url,
    method: Method,
    body: Option<String>,
    hawk_id: String,
    hawk_key: Vec<u8>,
}

impl HawkRequestBuilder {
    pub fn new(method: Method, url: Url, hawk_id: String, hawk_key: Vec<u8>) -> Self {
        HawkRequestBuilder {
            url: url,
            method: method,
            body: None,
            hawk_id: hawk_id,
            hawk_key: hawk_key,
        }
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn build(self) -> Result<Request> {
        let options = self.body
            .as_ref()
            .map(|body| hawk::Options::with_payload(body, CONTENT_TYPE_JSON));
        let method = format!("{}", self.method);
        let hawk_header = hawk::header(
            self.url.as_str(),
            &method,
            &self.hawk_id,
            &self.hawk_key,
            options,
        )?;

        let client = ReqwestClient::new();
        let mut request_builder = client.request(self.method, self.url);
        request_builder.header(header::Authorization(hawk_header.value));
        if let Some(body) = self.body {
            request_builder.header(header::ContentType(CONTENT_TYPE_JSON.parse().map_err(
                |_| Error::from("Invalid content type"),
            )?));
            request_builder.body(body);
        }

        Ok(request_builder.build()?)
    }
}
