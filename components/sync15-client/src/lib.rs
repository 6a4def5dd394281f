/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// `error_chain!` can recurse deeply and I guess we're just supposed to live with that...
#![recursion_limit = "1024"]

extern crate base64;
#[macro_use]
extern crate error_chain;
extern crate fxa_auth;
extern crate hex;
#[macro_use]
extern crate hyper;
#[macro_use]
extern crate log;
extern crate openssl;
extern crate reqwest;
extern crate serde;
#[macro_use]
extern crate serde_derive;
// Right now we only need the `json!` macro in tests, and a raw `#[macro_use]` gives us a warning
#[cfg_attr(test, macro_use)]
extern crate serde_json;
extern crate url;

pub mod bso_record;
pub mod collection_keys;
pub mod error;
pub mod key_bundle;
pub mod manager;
pub mod managers;
pub mod record_types;
pub mod records;
pub mod request;
pub mod service;
pub mod settings;
pub mod token;
pub mod util;
pub mod vault;

// Re-export some of the types callers are likely to want for convenience.
pub use bso_record::{BsoRecord, EncryptedBso, EncryptedPayload, MaybeTombstone};
pub use error::{Error, ErrorKind, Result};
pub use key_bundle::KeyBundle;
pub use manager::{ChangeKind, LocalChange, SynchronizableManager};
pub use records::{BookmarkRecord, HistoryRecord, OpenTabsRecord, RecordType, SyncRecord};
pub use service::{SyncService, SyncSignal};
pub use settings::{MemorySettings, SettingsStore, SharedSettings};
pub use util::{ServerTimestamp, SERVER_EPOCH};
pub use vault::{MemoryVault, SecretVault};
