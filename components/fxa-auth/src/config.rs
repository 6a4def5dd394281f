/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use url::Url;

use errors::*;

const RELEASE_AUTH_URL: &'static str = "https://api.accounts.firefox.com/v1/";
const RELEASE_TOKEN_SERVER_URL: &'static str = "https://token.services.mozilla.com/1.0/sync/1.5";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    auth_url: String,
    token_server_url: String,
}

impl Config {
    pub fn release() -> Config {
        Config::new(RELEASE_AUTH_URL, RELEASE_TOKEN_SERVER_URL)
    }

    pub fn new(auth_url: &str, token_server_url: &str) -> Config {
        Config {
            auth_url: auth_url.to_string(),
            token_server_url: token_server_url.to_string(),
        }
    }

    pub fn auth_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.auth_url)?)
    }

    pub fn auth_url_path(&self, path: &str) -> Result<Url> {
        Ok(self.auth_url()?.join(path)?)
    }

    pub fn token_server_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.token_server_url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = Config::release();
        assert_eq!(
            config.auth_url_path("account/keys").unwrap().to_string(),
            "https://api.accounts.firefox.com/v1/account/keys"
        );
        assert_eq!(
            config
                .auth_url_path("certificate/sign")
                .unwrap()
                .to_string(),
            "https://api.accounts.firefox.com/v1/certificate/sign"
        );
        assert_eq!(
            config.token_server_url().unwrap().to_string(),
            "https://token.services.mozilla.com/1.0/sync/1.5"
        );
    }
}
