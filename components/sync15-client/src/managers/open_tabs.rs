/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The tabs collection. We always want all records when syncing open tabs,
//! so every sync is an initial sync; remote records are only cached in
//! memory for display.

use fxa_auth::util as fxa_util;

use manager::{ChangeSender, SynchronizableManager};
use records::{OpenTabsRecord, RecordType, SyncRecord};
use settings::{self, SettingsStore, SharedSettings};
use util::ServerTimestamp;

pub struct OpenTabsManager {
    settings: SharedSettings,
    // What this device currently has open, in (title, url, icon) form.
    local_tabs: Vec<(String, String, String)>,
    remote_records: Vec<OpenTabsRecord>,
    changes: Option<ChangeSender>,
}

impl OpenTabsManager {
    pub fn new(settings: SharedSettings) -> OpenTabsManager {
        OpenTabsManager {
            settings: settings,
            local_tabs: Vec::new(),
            remote_records: Vec::new(),
            changes: None,
        }
    }

    /// The embedder reports the open tabs; they are pushed as one record per
    /// sync rather than per-tab changes.
    pub fn set_local_tabs(&mut self, tabs: Vec<(String, String, String)>) {
        self.local_tabs = tabs;
    }

    /// Other devices' records, as of the last sync.
    pub fn remote_tabs(&self) -> &[OpenTabsRecord] {
        &self.remote_records
    }

    pub fn clear_cache(&mut self) {
        self.remote_records.clear();
    }

    fn device_id(&self) -> String {
        self.settings
            .borrow()
            .get_string(settings::SYNC_CLIENT_ID)
            .unwrap_or_default()
    }

    fn local_record(&self) -> OpenTabsRecord {
        let id = self.device_id();
        let name = self.settings
            .borrow()
            .get_string(settings::SYNC_DEVICE_NAME)
            .unwrap_or_else(|| id.clone());
        let mut record = OpenTabsRecord::new(&id, &name);
        let now = fxa_util::now_secs() as i64;
        for &(ref title, ref url, ref icon) in &self.local_tabs {
            record.add_tab(title, url, icon, now);
        }
        record
    }
}

impl SynchronizableManager for OpenTabsManager {
    fn collection_name(&self) -> String {
        let with_firefox = self.settings
            .borrow()
            .get_bool(settings::SYNC_WITH_FIREFOX)
            .unwrap_or(true);
        if with_firefox {
            "tabs".to_string()
        } else {
            "app-tabs".to_string()
        }
    }

    fn record_type(&self) -> RecordType {
        RecordType::OpenTabs
    }

    fn is_initial_sync(&self) -> bool {
        true
    }

    fn set_is_initial_sync(&mut self, _is_initial: bool) {
        // Every sync of open tabs is an initial sync.
    }

    fn sync_time(&self) -> ServerTimestamp {
        let key = settings::sync_time_key(&self.collection_name());
        ServerTimestamp(self.settings.borrow().get_double(&key).unwrap_or(0.0))
    }

    fn set_sync_time(&mut self, sync_time: ServerTimestamp) {
        let key = settings::sync_time_key(&self.collection_name());
        self.settings.borrow_mut().set_double(&key, sync_time.0);
    }

    fn add(&mut self, _record: SyncRecord) {
        // Every sync of open tabs is an initial sync so we don't need this.
    }

    fn remove(&mut self, _record: &SyncRecord) {
        // Every sync of open tabs is an initial sync so we don't need this.
    }

    fn save(&mut self, _record: &SyncRecord) {
        // We don't care about the server time modified of open tabs records.
    }

    fn merge(
        &mut self,
        _is_initial: bool,
        _remotes_deleted: Vec<SyncRecord>,
        remotes_updated: Vec<SyncRecord>,
    ) -> Vec<SyncRecord> {
        let id = self.device_id();
        self.remote_records.clear();

        for remote in remotes_updated {
            if let SyncRecord::OpenTabs(record) = remote {
                // Exclude the record which describes the local open tabs.
                if record.id == id {
                    continue;
                }
                self.remote_records.push(record);
            }
        }

        // Only upload the local open tabs, we don't want to alter open tabs
        // of other clients; any previous value is overwritten. A device with
        // no tabs open has nothing worth uploading.
        let local = self.local_record();
        if local.tabs.is_empty() {
            Vec::new()
        } else {
            vec![SyncRecord::OpenTabs(local)]
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
    use settings::{MemorySettings, SettingsStore};

    fn manager_with_id(id: &str) -> OpenTabsManager {
        let settings = MemorySettings::new_shared();
        settings
            .borrow_mut()
            .set_string(settings::SYNC_CLIENT_ID, id);
        OpenTabsManager::new(settings)
    }

    fn tabs_record(id: &str, urls: &[&str]) -> SyncRecord {
        let mut record = OpenTabsRecord::new(id, id);
        for url in urls {
            record.add_tab("Title", url, "", 1);
        }
        SyncRecord::OpenTabs(record)
    }

    #[test]
    fn test_merge_uploads_local_record_only() {
        let mut manager = manager_with_id("local-device");
        manager.set_local_tabs(vec![
            (
                "Example".to_string(),
                "https://example.com/".to_string(),
                "".to_string(),
            ),
        ]);

        let to_upload = manager.merge(
            true,
            vec![],
            vec![
                tabs_record("remote-device", &["https://mozilla.org/"]),
                tabs_record("local-device", &["https://stale.example.com/"]),
            ],
        );

        assert_eq!(to_upload.len(), 1);
        let record = to_upload[0].as_open_tabs().unwrap();
        assert_eq!(record.id, "local-device");
        assert_eq!(record.tabs.len(), 1);

        // The cache holds the other devices, never our own record.
        assert_eq!(manager.remote_tabs().len(), 1);
        assert_eq!(manager.remote_tabs()[0].id, "remote-device");
    }

    #[test]
    fn test_merge_with_no_local_tabs_uploads_nothing() {
        let mut manager = manager_with_id("local-device");
        let to_upload = manager.merge(true, vec![], vec![tabs_record("other", &[])]);
        assert!(to_upload.is_empty());
        assert_eq!(manager.remote_tabs().len(), 1);
    }

    #[test]
    fn test_every_sync_is_initial() {
        let mut manager = manager_with_id("local-device");
        assert!(manager.is_initial_sync());
        manager.set_is_initial_sync(false);
        assert!(manager.is_initial_sync());
    }
}
