/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// `error_chain!` can recurse deeply and I guess we're just supposed to live with that...
#![recursion_limit = "1024"]

extern crate base64;
#[macro_use]
extern crate error_chain;
extern crate hex;
extern crate hkdf;
extern crate hmac;
#[macro_use]
extern crate log;
extern crate openssl;
extern crate reqwest;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate sha2;
extern crate url;

pub mod browser_id;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod hawk;
pub mod http;
pub mod util;

pub use browser_id::RsaKeyPair;
pub use config::Config;
pub use errors::{Error, ErrorKind, Result};
pub use http::Client;
