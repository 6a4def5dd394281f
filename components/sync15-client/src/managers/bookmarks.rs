/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The bookmarks collection. Compared to history, remote records need
//! filtering (Firefox also syncs folders, queries and separators here) and
//! id conflicts resolve differently: a same-id-different-url pair keeps
//! both bookmarks.

use std::collections::{BTreeSet, HashMap, HashSet};

use fxa_auth::crypto;
use fxa_auth::util as fxa_util;

use manager::{ChangeKind, ChangeSender, LocalChange, SynchronizableManager};
use records::{BookmarkRecord, RecordType, SyncRecord};
use settings::{self, SettingsStore, SharedSettings};
use util::ServerTimestamp;

/// Bookmarks filed under Firefox's mobile root keep this tag locally.
pub const MOBILE_TAG: &'static str = "mobile";

pub struct BookmarksManager {
    settings: SharedSettings,
    records: HashMap<String, BookmarkRecord>,
    // Every tag ever seen, the way a tag sidebar wants it.
    tags: BTreeSet<String>,
    changes: Option<ChangeSender>,
}

impl BookmarksManager {
    pub fn new(settings: SharedSettings) -> BookmarksManager {
        BookmarksManager {
            settings: settings,
            records: HashMap::new(),
            tags: BTreeSet::new(),
            changes: None,
        }
    }

    /// A bookmark created locally, outside of sync.
    pub fn add_bookmark(&mut self, bookmark: BookmarkRecord) {
        self.create_tags_from(&bookmark);
        self.records.insert(bookmark.id.clone(), bookmark.clone());
        self.emit(ChangeKind::Modified, bookmark);
    }

    /// A bookmark removed locally; the server copy gets a tombstone.
    pub fn remove_bookmark(&mut self, id: &str) {
        if let Some(bookmark) = self.records.remove(id) {
            self.emit(ChangeKind::Deleted, bookmark);
        }
    }

    pub fn records(&self) -> &HashMap<String, BookmarkRecord> {
        &self.records
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn emit(&self, kind: ChangeKind, record: BookmarkRecord) {
        if let Some(ref sender) = self.changes {
            let _ = sender.send(LocalChange {
                collection: self.collection_name(),
                kind: kind,
                record: SyncRecord::Bookmark(record),
            });
        }
    }

    fn id_by_url(&self, url: &str) -> Option<String> {
        self.records
            .values()
            .find(|record| record.bmk_uri == url)
            .map(|record| record.id.clone())
    }

    /// Ignore unfiled bookmarks and everything that is not of type bookmark;
    /// tag the ones living under the mobile root; stamp a missing time
    /// added.
    fn normalize_remote(remote: &mut BookmarkRecord) -> bool {
        if !remote.is_bookmark() || remote.parent_id == "unfiled" {
            return false;
        }
        if remote.parent_id == "mobile" && !remote.has_tag(MOBILE_TAG) {
            remote.add_tag(MOBILE_TAG);
        }
        // Bookmarks from server may miss the time added timestamp.
        if remote.time_added == 0 {
            remote.time_added = fxa_util::now() as i64 * 1000;
        }
        true
    }

    fn copy_tags(&mut self, from: &BookmarkRecord, into_id: &str) {
        if let Some(local) = self.records.get_mut(into_id) {
            for tag in &from.tags {
                local.add_tag(tag);
            }
        }
    }

    fn create_tags_from(&mut self, record: &BookmarkRecord) {
        for tag in &record.tags {
            self.tags.insert(tag.clone());
        }
    }

    fn handle_initial_merge(&mut self, remotes_updated: Vec<SyncRecord>) -> Vec<SyncRecord> {
        let mut dont_upload: HashSet<String> = HashSet::new();

        for remote in remotes_updated {
            let mut remote = match remote {
                SyncRecord::Bookmark(record) => record,
                _ => continue,
            };
            if !BookmarksManager::normalize_remote(&mut remote) {
                continue;
            }
            // In any case, pick up new tags from the remote bookmark.
            self.create_tags_from(&remote);

            let local_by_id = self.records.get(&remote.id).map(|b| b.bmk_uri.clone());
            match local_by_id {
                Some(ref local_url) if *local_url == remote.bmk_uri => {
                    // Same id, same url. Merge tags and reupload.
                    self.copy_tags(&remote, &remote.id.clone());
                    if let Some(local) = self.records.get_mut(&remote.id) {
                        local.server_time_modified = remote.server_time_modified;
                    }
                }
                Some(_) => {
                    // Same id, different url. Keep both and upload the local
                    // one under a fresh id.
                    let new_id = crypto::random_sync_id()
                        .unwrap_or_else(|_| format!("renamed-{}", remote.id));
                    let mut local = self.records.remove(&remote.id).unwrap();
                    local.id = new_id.clone();
                    self.records.insert(new_id, local);
                    dont_upload.insert(remote.id.clone());
                    self.records.insert(remote.id.clone(), remote);
                }
                None => {
                    if let Some(local_id) = self.id_by_url(&remote.bmk_uri) {
                        // Different id, same url. Keep the remote id, merge
                        // tags and reupload.
                        let mut local = self.records.remove(&local_id).unwrap();
                        local.id = remote.id.clone();
                        local.server_time_modified = remote.server_time_modified;
                        for tag in &remote.tags {
                            local.add_tag(tag);
                        }
                        self.records.insert(remote.id.clone(), local);
                    } else {
                        // Different id, different url. Add the remote
                        // bookmark as is.
                        dont_upload.insert(remote.id.clone());
                        self.records.insert(remote.id.clone(), remote);
                    }
                }
            }
        }

        let mut to_upload: Vec<SyncRecord> = self.records
            .values()
            .filter(|record| !dont_upload.contains(&record.id))
            .cloned()
            .map(SyncRecord::Bookmark)
            .collect();
        to_upload.sort_by(|a, b| a.id().cmp(b.id()));
        to_upload
    }

    fn handle_regular_merge(
        &mut self,
        remotes_deleted: Vec<SyncRecord>,
        remotes_updated: Vec<SyncRecord>,
    ) -> Vec<SyncRecord> {
        let mut to_upload = Vec::new();

        for tombstone in remotes_deleted {
            self.records.remove(tombstone.id());
        }

        for remote in remotes_updated {
            let mut remote = match remote {
                SyncRecord::Bookmark(record) => record,
                _ => continue,
            };
            if !BookmarksManager::normalize_remote(&mut remote) {
                continue;
            }
            self.create_tags_from(&remote);

            if self.records.contains_key(&remote.id) {
                // Same id. Overwrite the local bookmark.
                self.records.insert(remote.id.clone(), remote);
            } else if let Some(local_id) = self.id_by_url(&remote.bmk_uri) {
                // Different id, same url. Keep the remote id, merge tags and
                // reupload.
                let mut local = self.records.remove(&local_id).unwrap();
                local.id = remote.id.clone();
                local.server_time_modified = remote.server_time_modified;
                for tag in &remote.tags {
                    local.add_tag(tag);
                }
                to_upload.push(SyncRecord::Bookmark(local.clone()));
                self.records.insert(remote.id.clone(), local);
            } else {
                // Different id, different url. Add the remote bookmark.
                self.records.insert(remote.id.clone(), remote);
            }
        }

        to_upload
    }
}

impl SynchronizableManager for BookmarksManager {
    fn collection_name(&self) -> String {
        let with_firefox = self.settings
            .borrow()
            .get_bool(settings::SYNC_WITH_FIREFOX)
            .unwrap_or(true);
        if with_firefox {
            "bookmarks".to_string()
        } else {
            "app-bookmarks".to_string()
        }
    }

    fn record_type(&self) -> RecordType {
        RecordType::Bookmark
    }

    fn is_initial_sync(&self) -> bool {
        let key = settings::is_initial_key(&self.collection_name());
        self.settings.borrow().get_bool(&key).unwrap_or(true)
    }

    fn set_is_initial_sync(&mut self, is_initial: bool) {
        let key = settings::is_initial_key(&self.collection_name());
        self.settings.borrow_mut().set_bool(&key, is_initial);
    }

    fn sync_time(&self) -> ServerTimestamp {
        let key = settings::sync_time_key(&self.collection_name());
        ServerTimestamp(self.settings.borrow().get_double(&key).unwrap_or(0.0))
    }

    fn set_sync_time(&mut self, sync_time: ServerTimestamp) {
        let key = settings::sync_time_key(&self.collection_name());
        self.settings.borrow_mut().set_double(&key, sync_time.0);
    }

    fn add(&mut self, record: SyncRecord) {
        if let SyncRecord::Bookmark(record) = record {
            self.create_tags_from(&record);
            self.records.insert(record.id.clone(), record);
        }
    }

    fn remove(&mut self, record: &SyncRecord) {
        self.records.remove(record.id());
    }

    fn save(&mut self, record: &SyncRecord) {
        // Persist the refreshed server time so later uploads carry the right
        // X-If-Unmodified-Since.
        if let SyncRecord::Bookmark(ref record) = *record {
            if let Some(local) = self.records.get_mut(&record.id) {
                local.server_time_modified = record.server_time_modified;
            }
        }
    }

    fn merge(
        &mut self,
        is_initial: bool,
        remotes_deleted: Vec<SyncRecord>,
        remotes_updated: Vec<SyncRecord>,
    ) -> Vec<SyncRecord> {
        if is_initial {
            self.handle_initial_merge(remotes_updated)
        } else {
            self.handle_regular_merge(remotes_deleted, remotes_updated)
        }
    }

    fn connect_changes(&mut self, sender: ChangeSender) {
        self.changes = Some(sender);
    }

    fn disconnect_changes(&mut self) {
        self.changes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settings::MemorySettings;

    fn manager() -> BookmarksManager {
        BookmarksManager::new(MemorySettings::new_shared())
    }

    fn bookmark(id: &str, url: &str) -> BookmarkRecord {
        BookmarkRecord::new(id, "Title", url, 1)
    }

    fn remote(id: &str, url: &str) -> SyncRecord {
        SyncRecord::Bookmark(bookmark(id, url))
    }

    #[test]
    fn test_initial_merge_ignores_folders_and_unfiled() {
        let mut manager = manager();

        let mut folder = bookmark("folder-id", "");
        folder.bmk_type = "folder".to_string();
        let mut unfiled = bookmark("unfiled-id", "https://example.com/");
        unfiled.parent_id = "unfiled".to_string();

        let to_upload = manager.merge(
            true,
            vec![],
            vec![
                SyncRecord::Bookmark(folder),
                SyncRecord::Bookmark(unfiled),
            ],
        );
        assert!(manager.records().is_empty());
        assert!(to_upload.is_empty());
    }

    #[test]
    fn test_initial_merge_mobile_tag() {
        let mut manager = manager();
        let mut mobile = bookmark("mobile-id", "https://example.com/");
        mobile.parent_id = "mobile".to_string();

        manager.merge(true, vec![], vec![SyncRecord::Bookmark(mobile)]);
        assert!(manager.records()["mobile-id"].has_tag(MOBILE_TAG));
        assert!(manager.tags().contains(MOBILE_TAG));
    }

    #[test]
    fn test_initial_merge_same_id_different_url_keeps_both() {
        let mut manager = manager();
        manager.add(remote("A", "https://local.example.com/"));

        let to_upload = manager.merge(
            true,
            vec![],
            vec![remote("A", "https://remote.example.com/")],
        );

        assert_eq!(manager.records().len(), 2);
        // The remote record kept its id and is not reuploaded; the local
        // record moved to a fresh id and goes up.
        assert_eq!(
            manager.records()["A"].bmk_uri,
            "https://remote.example.com/"
        );
        assert_eq!(to_upload.len(), 1);
        assert_ne!(to_upload[0].id(), "A");
        assert_eq!(
            to_upload[0].as_bookmark().unwrap().bmk_uri,
            "https://local.example.com/"
        );
    }

    #[test]
    fn test_initial_merge_different_id_same_url_keeps_remote_id() {
        let mut manager = manager();
        let mut local = bookmark("local-id", "https://example.com/");
        local.add_tag("local-tag");
        manager.add(SyncRecord::Bookmark(local));

        let mut incoming = bookmark("remote-id", "https://example.com/");
        incoming.add_tag("remote-tag");
        let to_upload = manager.merge(true, vec![], vec![SyncRecord::Bookmark(incoming)]);

        assert_eq!(manager.records().len(), 1);
        let merged = &manager.records()["remote-id"];
        assert!(merged.has_tag("local-tag"));
        assert!(merged.has_tag("remote-tag"));
        // The merged record still needs a reupload.
        assert_eq!(to_upload.len(), 1);
        assert_eq!(to_upload[0].id(), "remote-id");
    }

    #[test]
    fn test_regular_merge_same_id_overwrites_local() {
        let mut manager = manager();
        let mut local = bookmark("A", "https://example.com/");
        local.title = "Old title".to_string();
        manager.add(SyncRecord::Bookmark(local));

        let mut incoming = bookmark("A", "https://example.com/");
        incoming.title = "New title".to_string();
        let to_upload = manager.merge(false, vec![], vec![SyncRecord::Bookmark(incoming)]);

        assert!(to_upload.is_empty());
        assert_eq!(manager.records()["A"].title, "New title");
    }

    #[test]
    fn test_regular_merge_tombstone() {
        let mut manager = manager();
        manager.add(remote("A", "https://example.com/"));
        manager.merge(false, vec![remote("A", "https://example.com/")], vec![]);
        assert!(manager.records().is_empty());
    }

    #[test]
    fn test_local_changes_are_announced() {
        use std::sync::mpsc::channel;

        let (sender, receiver) = channel();
        let mut manager = manager();
        manager.connect_changes(sender);

        manager.add_bookmark(bookmark("A", "https://example.com/"));
        assert_eq!(receiver.try_recv().unwrap().kind, ChangeKind::Modified);

        manager.remove_bookmark("A");
        assert_eq!(receiver.try_recv().unwrap().kind, ChangeKind::Deleted);
    }
}
