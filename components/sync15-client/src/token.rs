/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Token Server exchange: a BrowserID assertion plus the X-Client-State
//! goes in, short-lived storage credentials come out.

use std::io::Read;

use reqwest::{header, Client, Url};

use error::{ErrorKind, Result};
use request::XClientState;

/// What we get back, verbatim.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TokenserverToken {
    pub id: String,
    pub key: String,
    pub api_endpoint: String,
    pub uid: u64,
    // Seconds of validity from the moment of issue.
    pub duration: u64,
}

/// The ephemeral credentials every storage request is HAWK-signed with.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageCredentials {
    pub api_endpoint: String,
    pub key_id: String,
    pub key: String,
    /// Unix seconds.
    pub expires_at: u64,
}

impl StorageCredentials {
    /// Credentials count as expired 60 seconds ahead of their stated expiry
    /// so a request signed right now cannot arrive at the server stale.
    pub fn expired(&self, now_secs: u64) -> bool {
        now_secs + 60 >= self.expires_at
    }
}

pub fn credentials_from_token(token: TokenserverToken, now_secs: u64) -> StorageCredentials {
    StorageCredentials {
        api_endpoint: token.api_endpoint,
        key_id: token.id,
        key: token.key,
        expires_at: now_secs + token.duration,
    }
}

#[derive(Debug)]
pub struct TokenserverClient {
    server_url: Url,
}

impl TokenserverClient {
    pub fn new(server_url: Url) -> TokenserverClient {
        TokenserverClient {
            server_url: server_url,
        }
    }

    /// GET the token server. The X-Client-State header ties the request to
    /// the current kB so the server can tell key rotations apart.
    pub fn fetch_credentials(
        &self,
        client: &Client,
        assertion: &str,
        client_state: &str,
        now_secs: u64,
    ) -> Result<StorageCredentials> {
        let mut resp = client
            .get(self.server_url.clone())
            .header(header::Authorization(format!("BrowserID {}", assertion)))
            .header(XClientState(client_state.to_string()))
            .send()?;

        if !resp.status().is_success() {
            warn!("Non-success status when fetching token: {}", resp.status());
            let mut body = String::new();
            let _ = resp.read_to_string(&mut body);
            debug!("  Response body {}", body);
            bail!(ErrorKind::TokenserverHttpError(resp.status()));
        }

        let token: TokenserverToken = resp.json()?;
        Ok(credentials_from_token(token, now_secs))
    }
}
