/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The three synced record types and the sum type the engine moves around.
//! Field names follow the Firefox wire format; additional Firefox fields on
//! incoming records are accepted and ignored.

use serde::{Deserialize, Deserializer};
use serde_json;

use bso_record::{EncryptedBso, EncryptedPayload, MaybeTombstone};
use error::Result;
use key_bundle::KeyBundle;
use util::ServerTimestamp;

/// Firefox visit transition for a followed link; the only one we record.
pub const VISIT_TYPE_LINK: i64 = 1;

const BOOKMARK_TYPE: &'static str = "bookmark";
const BOOKMARK_PARENT_ID: &'static str = "toolbar";
const BOOKMARK_PARENT_NAME: &'static str = "Bookmarks Toolbar";

// Firefox serializes absent strings as JSON null.
fn nullable_string<'de, D>(deserializer: D) -> ::std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    History,
    OpenTabs,
    Bookmark,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryVisit {
    pub date: i64,
    #[serde(rename = "type")]
    pub visit_type: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    #[serde(default)]
    pub id: String,

    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,

    #[serde(rename = "histUri", default, deserialize_with = "nullable_string")]
    pub hist_uri: String,

    // Kept sorted descending by date.
    #[serde(default)]
    pub visits: Vec<HistoryVisit>,
}

impl HistoryRecord {
    pub fn new(id: &str, title: &str, uri: &str, last_visit_time: i64) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            title: title.to_string(),
            hist_uri: uri.to_string(),
            visits: vec![
                HistoryVisit {
                    date: last_visit_time,
                    visit_type: VISIT_TYPE_LINK,
                },
            ],
        }
    }

    /// The head timestamp, or -1 for a record with no visits ("forget about
    /// this site" leaves those behind).
    pub fn last_visit_time(&self) -> i64 {
        self.visits.first().map(|visit| visit.date).unwrap_or(-1)
    }

    /// Insert a visit keeping the descending order; returns false when the
    /// timestamp was already known.
    pub fn add_visit_time(&mut self, visit_time: i64) -> bool {
        if self.visits.iter().any(|visit| visit.date == visit_time) {
            return false;
        }
        let position = self.visits
            .iter()
            .position(|visit| visit.date < visit_time)
            .unwrap_or(self.visits.len());
        self.visits.insert(
            position,
            HistoryVisit {
                date: visit_time,
                visit_type: VISIT_TYPE_LINK,
            },
        );
        true
    }

    fn normalize(&mut self) {
        self.visits.sort_by(|a, b| b.date.cmp(&a.date));
        self.visits.dedup_by(|a, b| a.date == b.date);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenTab {
    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,

    // Only the most recent URL is ever filled in locally.
    #[serde(rename = "urlHistory", default)]
    pub url_history: Vec<String>,

    #[serde(default, deserialize_with = "nullable_string")]
    pub icon: String,

    #[serde(rename = "lastUsed", default)]
    pub last_used: i64,
}

/// One record per device; `id` is the device's client id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenTabsRecord {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "clientName", default, deserialize_with = "nullable_string")]
    pub client_name: String,

    #[serde(default)]
    pub tabs: Vec<OpenTab>,
}

impl OpenTabsRecord {
    pub fn new(id: &str, client_name: &str) -> OpenTabsRecord {
        OpenTabsRecord {
            id: id.to_string(),
            client_name: client_name.to_string(),
            tabs: Vec::new(),
        }
    }

    pub fn add_tab(&mut self, title: &str, url: &str, icon: &str, last_used: i64) {
        self.tabs.push(OpenTab {
            title: title.to_string(),
            url_history: vec![url.to_string()],
            icon: icon.to_string(),
            last_used: last_used,
        });
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BookmarkRecord {
    #[serde(default)]
    pub id: String,

    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,

    #[serde(rename = "bmkUri", default, deserialize_with = "nullable_string")]
    pub bmk_uri: String,

    // Kept sorted; Firefox stores folder membership here as well.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(rename = "type", default, deserialize_with = "nullable_string")]
    pub bmk_type: String,

    #[serde(rename = "parentid", default, deserialize_with = "nullable_string")]
    pub parent_id: String,

    #[serde(rename = "parentName", default, deserialize_with = "nullable_string")]
    pub parent_name: String,

    #[serde(rename = "loadInSidebar", default)]
    pub load_in_sidebar: bool,

    // This is not a Firefox bookmark property, so it never hits the wire.
    #[serde(skip)]
    pub time_added: i64,

    #[serde(skip)]
    pub server_time_modified: ServerTimestamp,
}

impl BookmarkRecord {
    pub fn new(id: &str, title: &str, url: &str, time_added: i64) -> BookmarkRecord {
        BookmarkRecord {
            id: id.to_string(),
            title: title.to_string(),
            bmk_uri: url.to_string(),
            tags: Vec::new(),
            bmk_type: BOOKMARK_TYPE.to_string(),
            parent_id: BOOKMARK_PARENT_ID.to_string(),
            parent_name: BOOKMARK_PARENT_NAME.to_string(),
            load_in_sidebar: false,
            time_added: time_added,
            server_time_modified: ServerTimestamp::default(),
        }
    }

    pub fn is_bookmark(&self) -> bool {
        self.bmk_type == BOOKMARK_TYPE
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.has_tag(tag) {
            let position = self.tags
                .iter()
                .position(|t| t.as_str() > tag)
                .unwrap_or(self.tags.len());
            self.tags.insert(position, tag.to_string());
        }
    }
}

/// What the engine hands to and receives from managers. One variant per
/// registered collection kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRecord {
    History(HistoryRecord),
    OpenTabs(OpenTabsRecord),
    Bookmark(BookmarkRecord),
}

impl SyncRecord {
    pub fn record_type(&self) -> RecordType {
        match *self {
            SyncRecord::History(_) => RecordType::History,
            SyncRecord::OpenTabs(_) => RecordType::OpenTabs,
            SyncRecord::Bookmark(_) => RecordType::Bookmark,
        }
    }

    pub fn id(&self) -> &str {
        match *self {
            SyncRecord::History(ref record) => &record.id,
            SyncRecord::OpenTabs(ref record) => &record.id,
            SyncRecord::Bookmark(ref record) => &record.id,
        }
    }

    /// Only bookmarks track their server modification time; history and
    /// open-tabs records do not care.
    pub fn server_time_modified(&self) -> ServerTimestamp {
        match *self {
            SyncRecord::Bookmark(ref record) => record.server_time_modified,
            _ => ServerTimestamp::default(),
        }
    }

    pub fn set_server_time_modified(&mut self, modified: ServerTimestamp) {
        if let SyncRecord::Bookmark(ref mut record) = *self {
            record.server_time_modified = modified;
        }
    }

    pub fn to_cleartext(&self) -> Result<String> {
        Ok(match *self {
            SyncRecord::History(ref record) => serde_json::to_string(record)?,
            SyncRecord::OpenTabs(ref record) => serde_json::to_string(record)?,
            SyncRecord::Bookmark(ref record) => serde_json::to_string(record)?,
        })
    }

    pub fn as_history(&self) -> Option<&HistoryRecord> {
        match *self {
            SyncRecord::History(ref record) => Some(record),
            _ => None,
        }
    }

    pub fn as_open_tabs(&self) -> Option<&OpenTabsRecord> {
        match *self {
            SyncRecord::OpenTabs(ref record) => Some(record),
            _ => None,
        }
    }

    pub fn as_bookmark(&self) -> Option<&BookmarkRecord> {
        match *self {
            SyncRecord::Bookmark(ref record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct TombstonePayload<'a> {
    id: &'a str,
    deleted: bool,
}

/// Decrypt a server BSO into a record plus its tombstone flag. The server
/// `modified` is rounded up to whole seconds before it lands on the record.
pub fn from_bso(
    bso: EncryptedBso,
    record_type: RecordType,
    key: &KeyBundle,
) -> Result<(SyncRecord, bool)> {
    let modified = bso.modified.ceil_secs();
    let (record, deleted) = match record_type {
        RecordType::History => match bso.decrypt::<HistoryRecord>(key)?.payload {
            MaybeTombstone::Record(mut record) => {
                record.normalize();
                (SyncRecord::History(record), false)
            }
            MaybeTombstone::Tombstone { id, .. } => (
                SyncRecord::History(HistoryRecord {
                    id: id,
                    ..HistoryRecord::default()
                }),
                true,
            ),
        },
        RecordType::OpenTabs => match bso.decrypt::<OpenTabsRecord>(key)?.payload {
            MaybeTombstone::Record(record) => (SyncRecord::OpenTabs(record), false),
            MaybeTombstone::Tombstone { id, .. } => (
                SyncRecord::OpenTabs(OpenTabsRecord {
                    id: id,
                    ..OpenTabsRecord::default()
                }),
                true,
            ),
        },
        RecordType::Bookmark => match bso.decrypt::<BookmarkRecord>(key)?.payload {
            MaybeTombstone::Record(record) => (SyncRecord::Bookmark(record), false),
            MaybeTombstone::Tombstone { id, .. } => (
                SyncRecord::Bookmark(BookmarkRecord {
                    id: id,
                    ..BookmarkRecord::default()
                }),
                true,
            ),
        },
    };

    let mut record = record;
    record.set_server_time_modified(modified);
    Ok((record, deleted))
}

/// Encrypt a record into the client-side BSO (no `modified`).
pub fn to_bso(record: &SyncRecord, key: &KeyBundle) -> Result<EncryptedBso> {
    let cleartext = record.to_cleartext()?;
    let payload = EncryptedPayload::from_cleartext(&cleartext, key)?;
    Ok(EncryptedBso::new(record.id().to_string(), payload))
}

/// The `{id, deleted: true}` payload marking a server-side deletion.
pub fn tombstone_bso(id: &str, key: &KeyBundle) -> Result<EncryptedBso> {
    let cleartext = serde_json::to_string(&TombstonePayload {
        id: id,
        deleted: true,
    })?;
    let payload = EncryptedPayload::from_cleartext(&cleartext, key)?;
    Ok(EncryptedBso::new(id.to_string(), payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bso_record::BsoRecord;

    #[test]
    fn test_history_last_visit_time() {
        let mut record = HistoryRecord::new("id", "Example", "https://example.com", 100);
        assert_eq!(record.last_visit_time(), 100);
        assert!(record.add_visit_time(250));
        assert_eq!(record.last_visit_time(), 250);
        assert!(record.add_visit_time(50));
        assert_eq!(record.last_visit_time(), 250);
        // Duplicates are rejected.
        assert!(!record.add_visit_time(100));
        let dates: Vec<i64> = record.visits.iter().map(|visit| visit.date).collect();
        assert_eq!(dates, vec![250, 100, 50]);

        record.visits.clear();
        assert_eq!(record.last_visit_time(), -1);
    }

    #[test]
    fn test_history_null_title_and_unknown_fields() {
        let cleartext = r#"{
            "id": "abcdefghijkl",
            "title": null,
            "histUri": "https://example.com/",
            "visits": [{"date": 5, "type": 1}, {"date": 9, "type": 2}],
            "sortindex": 2000
        }"#;
        let mut history: HistoryRecord = serde_json::from_str(cleartext).unwrap();
        history.normalize();
        assert_eq!(history.title, "");
        // Visits get sorted descending on the way in.
        assert_eq!(history.last_visit_time(), 9);
    }

    #[test]
    fn test_open_tabs_serialization() {
        let mut record = OpenTabsRecord::new("device-id", "My Browser");
        record.add_tab("Example", "https://example.com/", "", 1234);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["clientName"], json!("My Browser"));
        assert_eq!(value["tabs"][0]["urlHistory"], json!(["https://example.com/"]));
        assert_eq!(value["tabs"][0]["lastUsed"], json!(1234));
    }

    #[test]
    fn test_bookmark_tags_round_trip_empty() {
        let record = BookmarkRecord::new("id", "Example", "https://example.com/", 77);
        let serialized = serde_json::to_string(&record).unwrap();
        let value: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(value["tags"], json!([]));
        assert!(value.get("time_added").is_none());
        assert_eq!(value["parentid"], json!("toolbar"));

        let again: BookmarkRecord = serde_json::from_str(&serialized).unwrap();
        assert_eq!(again.tags, Vec::<String>::new());
        // Local-only state does not survive the wire, by construction.
        assert_eq!(again.time_added, 0);
    }

    #[test]
    fn test_bookmark_tags_sorted() {
        let mut record = BookmarkRecord::new("id", "t", "u", 0);
        record.add_tag("zebra");
        record.add_tag("alpha");
        record.add_tag("zebra");
        assert_eq!(record.tags, vec!["alpha", "zebra"]);
    }

    #[test]
    fn test_bso_round_trip() {
        let key = KeyBundle::new_random().unwrap();
        let record = SyncRecord::History(HistoryRecord::new(
            "abcdefghijkl",
            "Example",
            "https://example.com/",
            1000,
        ));
        let bso = to_bso(&record, &key).unwrap();
        let (got, deleted) = from_bso(bso, RecordType::History, &key).unwrap();
        assert!(!deleted);
        assert_eq!(got, record);
    }

    #[test]
    fn test_tombstone_round_trip() {
        let key = KeyBundle::new_random().unwrap();
        let bso = tombstone_bso("abcdefghijkl", &key).unwrap();
        let (record, deleted) = from_bso(bso, RecordType::History, &key).unwrap();
        assert!(deleted);
        assert_eq!(record.id(), "abcdefghijkl");
        // A tombstone carries nothing besides its id.
        assert!(record.as_history().unwrap().visits.is_empty());
    }

    #[test]
    fn test_from_bso_ceils_modified() {
        let key = KeyBundle::new_random().unwrap();
        let record = SyncRecord::Bookmark(BookmarkRecord::new("id", "t", "u", 0));
        let mut bso = to_bso(&record, &key).unwrap();
        bso.modified = ServerTimestamp(1234.25);
        let (got, _) = from_bso(bso, RecordType::Bookmark, &key).unwrap();
        assert_eq!(got.server_time_modified(), ServerTimestamp(1235.0));
    }

    #[test]
    fn test_bso_wire_shape() {
        let key = KeyBundle::new_random().unwrap();
        let record = SyncRecord::History(HistoryRecord::new("wire-id", "t", "u", 1));
        let bso = to_bso(&record, &key).unwrap();
        let serialized = serde_json::to_string(&bso).unwrap();
        let value: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        // Client BSOs are {id, payload} and payload is a JSON string.
        assert_eq!(value["id"], json!("wire-id"));
        assert!(value["payload"].is_string());
        assert!(value.get("modified").is_none());
        let payload: serde_json::Value =
            serde_json::from_str(value["payload"].as_str().unwrap()).unwrap();
        assert!(payload["IV"].is_string());
        assert!(payload["hmac"].is_string());
        assert!(payload["ciphertext"].is_string());

        // And it parses back as a BSO whose payload decrypts.
        let parsed: BsoRecord<EncryptedPayload> = serde_json::from_str(&serialized).unwrap();
        assert!(parsed.payload.decrypt(&key).is_ok());
    }

    #[test]
    fn test_bookmark_firefox_compat_input() {
        let cleartext = r#"{
            "id": "abcdefghijkl",
            "type": "bookmark",
            "title": "Example",
            "parentName": "menu",
            "bmkUri": "https://example.com/",
            "tags": ["work"],
            "keyword": null,
            "description": null,
            "loadInSidebar": false,
            "parentid": "menu"
        }"#;
        let bookmark: BookmarkRecord = serde_json::from_str(cleartext).unwrap();
        assert!(bookmark.is_bookmark());
        assert_eq!(bookmark.tags, vec!["work"]);
        assert_eq!(bookmark.parent_id, "menu");
    }
}
