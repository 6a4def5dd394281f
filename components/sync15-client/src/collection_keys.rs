/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;

use serde_json;

use bso_record::EncryptedPayload;
use error::Result;
use key_bundle::KeyBundle;

/// The cleartext shape of the crypto/keys record. This exact JSON is also
/// what gets cached in the secret vault under `crypto_keys`.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct CryptoKeysRecord {
    pub id: String,
    pub collection: String,
    pub default: [String; 2],
    #[serde(default)]
    pub collections: HashMap<String, [String; 2]>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectionKeys {
    pub default: KeyBundle,
    pub collections: HashMap<String, KeyBundle>,
}

impl CollectionKeys {
    /// A brand new default bundle, for the crypto/keys 404 bootstrap path.
    pub fn new_random() -> Result<CollectionKeys> {
        Ok(CollectionKeys {
            default: KeyBundle::new_random()?,
            collections: HashMap::new(),
        })
    }

    pub fn from_cleartext_json(json: &str) -> Result<CollectionKeys> {
        let record: CryptoKeysRecord = serde_json::from_str(json)?;
        CollectionKeys::from_record(record)
    }

    pub fn to_cleartext_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_record())?)
    }

    pub fn from_encrypted_payload(
        payload: &EncryptedPayload,
        root_key: &KeyBundle,
    ) -> Result<CollectionKeys> {
        let cleartext = payload.decrypt(root_key)?;
        CollectionKeys::from_cleartext_json(&cleartext)
    }

    pub fn to_encrypted_payload(&self, root_key: &KeyBundle) -> Result<EncryptedPayload> {
        EncryptedPayload::from_cleartext(&self.to_cleartext_json()?, root_key)
    }

    #[inline]
    pub fn key_for_collection<'a>(&'a self, collection: &str) -> &'a KeyBundle {
        self.collections.get(collection).unwrap_or(&self.default)
    }

    fn from_record(record: CryptoKeysRecord) -> Result<CollectionKeys> {
        let mut collections = HashMap::new();
        for (collection, arr) in record.collections {
            collections.insert(collection, KeyBundle::from_base64(&arr[0], &arr[1])?);
        }
        Ok(CollectionKeys {
            default: KeyBundle::from_base64(&record.default[0], &record.default[1])?,
            collections: collections,
        })
    }

    fn to_record(&self) -> CryptoKeysRecord {
        CryptoKeysRecord {
            id: "keys".into(),
            collection: "crypto".into(),
            default: self.default.to_b64_array(),
            collections: self.collections
                .iter()
                .map(|kv| (kv.0.clone(), kv.1.to_b64_array()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleartext_roundtrip() {
        let keys = CollectionKeys::new_random().unwrap();
        let json = keys.to_cleartext_json().unwrap();
        let again = CollectionKeys::from_cleartext_json(&json).unwrap();
        assert_eq!(keys, again);

        // The stored shape always carries a default array plus the record
        // id/collection markers.
        let value: ::serde_json::Value = ::serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], json!("keys"));
        assert_eq!(value["collection"], json!("crypto"));
        assert_eq!(value["default"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let root_key = KeyBundle::new_random().unwrap();
        let mut keys = CollectionKeys::new_random().unwrap();
        keys.collections
            .insert("bookmarks".to_string(), KeyBundle::new_random().unwrap());

        let payload = keys.to_encrypted_payload(&root_key).unwrap();
        let again = CollectionKeys::from_encrypted_payload(&payload, &root_key).unwrap();
        assert_eq!(keys, again);
    }

    #[test]
    fn test_key_for_collection_falls_back_to_default() {
        let mut keys = CollectionKeys::new_random().unwrap();
        let bookmarks_key = KeyBundle::new_random().unwrap();
        keys.collections
            .insert("bookmarks".to_string(), bookmarks_key.clone());

        assert_eq!(keys.key_for_collection("bookmarks"), &bookmarks_key);
        assert_eq!(keys.key_for_collection("history"), &keys.default);
    }

    #[test]
    fn test_missing_collections_member_is_tolerated() {
        let keys = CollectionKeys::new_random().unwrap();
        let arr = keys.default.to_b64_array();
        let json = json!({
            "id": "keys",
            "collection": "crypto",
            "default": [arr[0].clone(), arr[1].clone()],
        }).to_string();
        let parsed = CollectionKeys::from_cleartext_json(&json).unwrap();
        assert_eq!(parsed.default, keys.default);
        assert!(parsed.collections.is_empty());
    }
}
