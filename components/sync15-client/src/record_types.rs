/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The unencrypted bookkeeping records: meta/global and this device's entry
//! in the clients collection.

use std::collections::HashMap;

use fxa_auth::crypto;

use error::Result;

pub const STORAGE_VERSION: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaGlobalEngine {
    pub version: i64,
    #[serde(rename = "syncID")]
    pub sync_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaGlobalRecord {
    #[serde(rename = "syncID")]
    pub sync_id: String,
    #[serde(rename = "storageVersion")]
    pub storage_version: i64,
    #[serde(default)]
    pub engines: HashMap<String, MetaGlobalEngine>,
    #[serde(default)]
    pub declined: Vec<String>,
}

impl MetaGlobalRecord {
    /// The record uploaded when the server has no meta/global yet. The
    /// engine versions and the declined list mirror what Firefox expects
    /// from a desktop client.
    pub fn fresh() -> Result<MetaGlobalRecord> {
        let mut engines = HashMap::new();
        engines.insert("clients".to_string(), MetaGlobalEngine::new(1)?);
        engines.insert("bookmarks".to_string(), MetaGlobalEngine::new(2)?);
        engines.insert("history".to_string(), MetaGlobalEngine::new(1)?);
        engines.insert("passwords".to_string(), MetaGlobalEngine::new(1)?);
        engines.insert("forms".to_string(), MetaGlobalEngine::new(1)?);
        Ok(MetaGlobalRecord {
            sync_id: crypto::random_sync_id()?,
            storage_version: STORAGE_VERSION,
            engines: engines,
            declined: vec![
                "addons".to_string(),
                "prefs".to_string(),
                "tabs".to_string(),
            ],
        })
    }
}

impl MetaGlobalEngine {
    fn new(version: i64) -> Result<MetaGlobalEngine> {
        Ok(MetaGlobalEngine {
            version: version,
            sync_id: crypto::random_sync_id()?,
        })
    }
}

/// This device's self-describing record in the `clients` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub os: String,
    pub application: String,
    pub protocols: Vec<String>,
    #[serde(rename = "fxaDeviceId")]
    pub fxa_device_id: String,
}

impl ClientRecord {
    pub fn new(id: &str, application: &str, os: &str, fxa_device_id: &str) -> ClientRecord {
        ClientRecord {
            id: id.to_string(),
            name: format!("{} on {}", id, application),
            client_type: "desktop".to_string(),
            os: os.to_string(),
            application: application.to_string(),
            protocols: vec![format!("1.{}", STORAGE_VERSION)],
            fxa_device_id: fxa_device_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    #[test]
    fn test_fresh_meta_global() {
        let record = MetaGlobalRecord::fresh().unwrap();
        assert_eq!(record.storage_version, 5);
        assert_eq!(record.sync_id.len(), 12);
        assert!(record.engines.contains_key("clients"));
        assert_eq!(record.engines["bookmarks"].version, 2);
        assert_eq!(record.declined, vec!["addons", "prefs", "tabs"]);

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["storageVersion"], json!(5));
        assert!(value["engines"]["history"]["syncID"].is_string());
    }

    #[test]
    fn test_client_record_shape() {
        let record = ClientRecord::new("AAAAAAAAAAAA", "WebBrowser", "Linux", "deadbeef");
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["id"], json!("AAAAAAAAAAAA"));
        assert_eq!(value["name"], json!("AAAAAAAAAAAA on WebBrowser"));
        assert_eq!(value["type"], json!("desktop"));
        assert_eq!(value["protocols"], json!(["1.5"]));
        assert_eq!(value["fxaDeviceId"], json!("deadbeef"));
    }
}
