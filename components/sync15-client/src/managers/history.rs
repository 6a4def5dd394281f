/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The history collection. A history record is uniquely identified by its
//! sync id or by its URL: same id implies same URL, but same URL does not
//! necessarily mean same id. The merge logic is built on that assumption.

use std::collections::HashMap;

use fxa_auth::crypto;

use manager::{ChangeKind, ChangeSender, LocalChange, SynchronizableManager};
use records::{HistoryRecord, RecordType, SyncRecord};
use settings::{self, SettingsStore, SharedSettings};
use util::ServerTimestamp;

pub struct HistoryManager {
    settings: SharedSettings,
    // The local store, indexed by sync id.
    records: HashMap<String, HistoryRecord>,
    changes: Option<ChangeSender>,
}

impl HistoryManager {
    pub fn new(settings: SharedSettings) -> HistoryManager {
        HistoryManager {
            settings: settings,
            records: HashMap::new(),
            changes: None,
        }
    }

    /// Record a local visit. New URLs get a fresh sync id; the change is
    /// announced so the service uploads it.
    pub fn visit_url(&mut self, url: &str, title: &str, visit_time: i64) {
        let existing_id = self.id_by_url(url);
        let record = match existing_id {
            Some(id) => {
                let record = self.records.get_mut(&id).unwrap();
                record.add_visit_time(visit_time);
                record.clone()
            }
            None => {
                let id = crypto::random_sync_id().unwrap_or_else(|_| url.to_string());
                let record = HistoryRecord::new(&id, title, url, visit_time);
                self.records.insert(id, record.clone());
                record
            }
        };
        self.emit(ChangeKind::Modified, record);
    }

    /// Forget a URL locally and announce the deletion so the server copy is
    /// tombstoned too.
    pub fn delete_url(&mut self, url: &str) {
        if let Some(id) = self.id_by_url(url) {
            if let Some(record) = self.records.remove(&id) {
                self.emit(ChangeKind::Deleted, record);
            }
        }
    }

    pub fn records(&self) -> &HashMap<String, HistoryRecord> {
        &self.records
    }

    fn id_by_url(&self, url: &str) -> Option<String> {
        self.records
            .values()
            .find(|record| record.hist_uri == url)
            .map(|record| record.id.clone())
    }

    fn emit(&self, kind: ChangeKind, record: HistoryRecord) {
        if let Some(ref sender) = self.changes {
            let _ = sender.send(LocalChange {
                collection: self.collection_name(),
                kind: kind,
                record: SyncRecord::History(record),
            });
        }
    }

    /// Different id, same URL: the local id wins. The caller has already
    /// announced the stale remote id for deletion.
    fn adopt_local_id(local: &HistoryRecord, remote: &mut HistoryRecord) {
        remote.id = local.id.clone();
        remote.add_visit_time(local.last_visit_time());
    }

    fn handle_initial_merge(&mut self, remotes_updated: Vec<SyncRecord>) -> Vec<SyncRecord> {
        let mut to_upload = Vec::new();
        let mut remaining: Vec<String> = self.records.keys().cloned().collect();

        for remote in remotes_updated {
            let mut remote = match remote {
                SyncRecord::History(record) => record,
                _ => continue,
            };
            let remote_last_visit_time = remote.last_visit_time();

            if let Some(local_last_visit_time) =
                self.records.get(&remote.id).map(|r| r.last_visit_time())
            {
                // Same id, same URL. Add the visits missing on either side;
                // only reupload when the remote learned something new.
                {
                    let local = self.records.get_mut(&remote.id).unwrap();
                    if remote_last_visit_time > local_last_visit_time {
                        local.add_visit_time(remote_last_visit_time);
                    }
                }
                if remote.add_visit_time(local_last_visit_time) {
                    to_upload.push(SyncRecord::History(remote.clone()));
                }
                remaining.retain(|id| id != &remote.id);
            } else if let Some(local_id) = self.id_by_url(&remote.hist_uri) {
                // Different id, same URL. Keep the local id and retire the
                // remote one with a tombstone.
                self.emit(ChangeKind::Deleted, remote.clone());
                {
                    let local = self.records.get_mut(&local_id).unwrap();
                    HistoryManager::adopt_local_id(local, &mut remote);
                    *local = remote.clone();
                }
                to_upload.push(SyncRecord::History(remote));
                remaining.retain(|id| id != &local_id);
            } else if remote_last_visit_time > 0 {
                // Different id, different URL. This is a new record.
                self.records.insert(remote.id.clone(), remote);
            }
        }

        // Everything the server did not know about goes up.
        for id in remaining {
            to_upload.push(SyncRecord::History(self.records[&id].clone()));
        }

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
                SyncRecord::History(record) => record,
                _ => continue,
            };
            let remote_last_visit_time = remote.last_visit_time();

            if self.records.contains_key(&remote.id) {
                // Firefox offers the option to "forget about this site",
                // which keeps the record on the server but strips its visit
                // times. We cannot represent a visitless page, so delete it
                // locally for good.
                if remote_last_visit_time <= 0 {
                    self.records.remove(&remote.id);
                } else {
                    let local = self.records.get_mut(&remote.id).unwrap();
                    if remote_last_visit_time > local.last_visit_time() {
                        local.add_visit_time(remote_last_visit_time);
                    }
                }
            } else if let Some(local_id) = self.id_by_url(&remote.hist_uri) {
                self.emit(ChangeKind::Deleted, remote.clone());
                {
                    let local = self.records.get_mut(&local_id).unwrap();
                    HistoryManager::adopt_local_id(local, &mut remote);
                    *local = remote.clone();
                }
                to_upload.push(SyncRecord::History(remote));
            } else if remote_last_visit_time > 0 {
                self.records.insert(remote.id.clone(), remote);
            }
        }

        to_upload
    }
}

impl SynchronizableManager for HistoryManager {
    fn collection_name(&self) -> String {
        let with_firefox = self.settings
            .borrow()
            .get_bool(settings::SYNC_WITH_FIREFOX)
            .unwrap_or(true);
        if with_firefox {
            "history".to_string()
        } else {
            "app-history".to_string()
        }
    }

    fn record_type(&self) -> RecordType {
        RecordType::History
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
        if let SyncRecord::History(record) = record {
            if record.last_visit_time() > 0 {
                self.records.insert(record.id.clone(), record);
            }
        }
    }

    fn remove(&mut self, record: &SyncRecord) {
        self.records.remove(record.id());
    }

    fn save(&mut self, _record: &SyncRecord) {
        // We don't care about the server time modified of history records.
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
