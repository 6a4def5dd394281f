/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The secret vault holds one JSON blob per account email: the uid, session
//! token, master key and cached crypto/keys. The embedding browser provides
//! the real keyring-backed implementation.

use std::collections::HashMap;

use error::Result;

pub trait SecretVault {
    fn load(&self, account: &str) -> Result<Option<String>>;
    fn store(&mut self, account: &str, secrets_json: &str) -> Result<()>;
    fn clear(&mut self, account: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryVault {
    entries: HashMap<String, String>,
}

impl MemoryVault {
    pub fn new() -> MemoryVault {
        MemoryVault::default()
    }
}

impl SecretVault for MemoryVault {
    fn load(&self, account: &str) -> Result<Option<String>> {
        Ok(self.entries.get(account).cloned())
    }

    fn store(&mut self, account: &str, secrets_json: &str) -> Result<()> {
        self.entries
            .insert(account.to_string(), secrets_json.to_string());
        Ok(())
    }

    fn clear(&mut self, account: &str) -> Result<()> {
        self.entries.remove(account);
        Ok(())
    }
}
