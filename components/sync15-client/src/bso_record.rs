/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use base64;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json;

use error;
use key_bundle::KeyBundle;
use util::ServerTimestamp;

/// The server-side envelope. The client never serializes `modified`; the
/// server stamps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BsoRecord<T> {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    #[serde(skip_serializing, default)]
    pub modified: ServerTimestamp,

    // We do some serde magic here with serde to parse the payload from JSON as we deserialize.
    // This avoids having a separate intermediate type that only exists so that we can deserialize
    // it's payload field as JSON (Especially since this one is going to exist more-or-less just so
    // that we can decrypt the data...
    #[serde(with = "as_json", bound(
        serialize = "T: Serialize",
        deserialize = "T: DeserializeOwned"))]
    pub payload: T,
}

impl<T> BsoRecord<T> {
    pub fn new(id: String, payload: T) -> BsoRecord<T> {
        BsoRecord {
            id: id,
            collection: None,
            modified: ServerTimestamp::default(),
            payload: payload,
        }
    }

    #[inline]
    pub fn with_payload<P>(self, payload: P) -> BsoRecord<P> {
        BsoRecord {
            id: self.id,
            collection: self.collection,
            modified: self.modified,
            payload: payload,
        }
    }
}

// Contains the methods to automatically deserialize the payload to/from json.
mod as_json {
    use serde::de::{self, Deserialize, DeserializeOwned, Deserializer};
    use serde::ser::{self, Serialize, Serializer};
    use serde_json;

    pub fn serialize<T, S>(t: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let j = serde_json::to_string(t).map_err(ser::Error::custom)?;
        serializer.serialize_str(&j)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: DeserializeOwned,
        D: Deserializer<'de>,
    {
        let j = String::deserialize(deserializer)?;
        serde_json::from_str(&j).map_err(de::Error::custom)
    }
}

/// The `{ciphertext, IV, hmac}` triple a BSO payload decrypts from. A
/// missing member is a deserialization error; nothing gets decrypted on a
/// malformed payload.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EncryptedPayload {
    #[serde(rename = "IV")]
    pub iv: String,
    pub hmac: String,
    pub ciphertext: String,
}

impl EncryptedPayload {
    pub fn from_cleartext(cleartext: &str, key: &KeyBundle) -> error::Result<EncryptedPayload> {
        let (enc_bytes, iv) = key.encrypt_bytes_rand_iv(cleartext.as_bytes())?;
        let iv_base64 = base64::encode(&iv);
        let enc_base64 = base64::encode(&enc_bytes);
        let hmac = key.hmac_string(&enc_base64)?;
        Ok(EncryptedPayload {
            iv: iv_base64,
            hmac: hmac,
            ciphertext: enc_base64,
        })
    }

    /// Verify the HMAC (in constant time, over the base64 ciphertext text)
    /// and decrypt. A record with a bad MAC is never decrypted.
    pub fn decrypt(&self, key: &KeyBundle) -> error::Result<String> {
        if !key.verify_hmac_string(&self.hmac, &self.ciphertext)? {
            return Err(error::ErrorKind::HmacMismatch.into());
        }
        let iv = base64::decode(&self.iv)?;
        let ciphertext = base64::decode(&self.ciphertext)?;
        key.decrypt(&ciphertext, &iv)
    }

    /// Parse the `payload` string of a BSO the server handed us.
    pub fn from_payload_string(payload: &str) -> error::Result<EncryptedPayload> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn serialized(&self) -> error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub type EncryptedBso = BsoRecord<EncryptedPayload>;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MaybeTombstone<T> {
    Tombstone { id: String, deleted: bool },
    Record(T),
}

impl<T> MaybeTombstone<T> {
    #[inline]
    pub fn tombstone<R: Into<String>>(id: R) -> MaybeTombstone<T> {
        MaybeTombstone::Tombstone {
            id: id.into(),
            deleted: true,
        }
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        match *self {
            MaybeTombstone::Record(_) => false,
            _ => true,
        }
    }

    #[inline]
    pub fn record(self) -> Option<T> {
        match self {
            MaybeTombstone::Record(record) => Some(record),
            _ => None,
        }
    }
}

impl BsoRecord<EncryptedPayload> {
    pub fn decrypt<T>(self, key: &KeyBundle) -> error::Result<BsoRecord<MaybeTombstone<T>>>
    where
        T: DeserializeOwned,
    {
        let cleartext = self.payload.decrypt(key)?;
        let new_payload = serde_json::from_str::<MaybeTombstone<T>>(&cleartext)?;
        Ok(self.with_payload(new_payload))
    }
}

impl<T> BsoRecord<T>
where
    T: Serialize,
{
    pub fn encrypt(self, key: &KeyBundle) -> error::Result<EncryptedBso> {
        let cleartext = serde_json::to_string(&self.payload)?;
        let new_payload = EncryptedPayload::from_cleartext(&cleartext, key)?;
        Ok(self.with_payload(new_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
    struct DummyRecord {
        id: String,
        age: i64,
        meta: String,
    }

    fn dummy() -> BsoRecord<MaybeTombstone<DummyRecord>> {
        BsoRecord::new(
            "aaaaaaaaaaaa".into(),
            MaybeTombstone::Record(DummyRecord {
                id: "aaaaaaaaaaaa".into(),
                age: 105,
                meta: "data".into(),
            }),
        )
    }

    #[test]
    fn test_deserialize_enc() {
        let serialized = r#"{
            "id": "1234",
            "collection": "passwords",
            "modified": 12344321.0,
            "payload": "{\"IV\": \"aaaaa\", \"hmac\": \"bbbbb\", \"ciphertext\": \"ccccc\"}"
        }"#;
        let record: BsoRecord<EncryptedPayload> = serde_json::from_str(serialized).unwrap();
        assert_eq!(&record.id, "1234");
        assert_eq!(&record.collection.unwrap(), "passwords");
        assert_eq!(record.modified, ServerTimestamp(12344321.0));
        assert_eq!(&record.payload.iv, "aaaaa");
        assert_eq!(&record.payload.hmac, "bbbbb");
        assert_eq!(&record.payload.ciphertext, "ccccc");
    }

    #[test]
    fn test_serialize_enc() {
        let goal = r#"{"id":"1234","payload":"{\"IV\":\"aaaaa\",\"hmac\":\"bbbbb\",\"ciphertext\":\"ccccc\"}"}"#;
        let record = BsoRecord::new(
            "1234".into(),
            EncryptedPayload {
                iv: "aaaaa".into(),
                hmac: "bbbbb".into(),
                ciphertext: "ccccc".into(),
            },
        );
        let actual = serde_json::to_string(&record).unwrap();
        assert_eq!(actual, goal);
    }

    #[test]
    fn test_roundtrip_crypt_record() {
        let orig_record = dummy();
        let keybundle = KeyBundle::new_random().unwrap();
        let encrypted = orig_record.clone().encrypt(&keybundle).unwrap();
        assert!(
            keybundle
                .verify_hmac_string(&encrypted.payload.hmac, &encrypted.payload.ciphertext)
                .unwrap()
        );

        let decrypted: BsoRecord<MaybeTombstone<DummyRecord>> =
            encrypted.decrypt(&keybundle).unwrap();
        assert!(!decrypted.payload.is_tombstone());
        assert_eq!(decrypted, orig_record);
    }

    #[test]
    fn test_roundtrip_crypt_tombstone() {
        let orig_record: BsoRecord<MaybeTombstone<DummyRecord>> =
            BsoRecord::new("aaaaaaaaaaaa".into(), MaybeTombstone::tombstone("aaaaaaaaaaaa"));
        assert!(orig_record.payload.is_tombstone());

        let keybundle = KeyBundle::new_random().unwrap();
        let encrypted = orig_record.clone().encrypt(&keybundle).unwrap();
        let decrypted: BsoRecord<MaybeTombstone<DummyRecord>> =
            encrypted.decrypt(&keybundle).unwrap();
        assert!(decrypted.payload.is_tombstone());
        assert_eq!(decrypted, orig_record);
    }

    #[test]
    fn test_tampered_hmac_is_never_decrypted() {
        let keybundle = KeyBundle::new_random().unwrap();
        let mut encrypted = dummy().encrypt(&keybundle).unwrap();
        // Flip one bit in the hex hmac.
        let flipped = if encrypted.payload.hmac.remove(0) == '0' {
            '1'
        } else {
            '0'
        };
        encrypted.payload.hmac.insert(0, flipped);
        let err = encrypted
            .decrypt::<DummyRecord>(&keybundle)
            .unwrap_err();
        match *err.kind() {
            error::ErrorKind::HmacMismatch => {}
            ref kind => panic!("unexpected error kind: {:?}", kind),
        }
    }

    #[test]
    fn test_missing_payload_member_is_an_error() {
        assert!(EncryptedPayload::from_payload_string("{\"IV\": \"aaaa\"}").is_err());
        assert!(EncryptedPayload::from_payload_string("not json").is_err());
    }
}
