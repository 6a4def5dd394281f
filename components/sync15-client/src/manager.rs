/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The one polymorphic seam of the engine: every synced collection is
//! driven through this trait. Managers announce local changes made outside
//! of a sync through the channel wired up at registration; the service is
//! the only subscriber.

use std::sync::mpsc::Sender;

use records::{RecordType, SyncRecord};
use util::ServerTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct LocalChange {
    pub collection: String,
    pub kind: ChangeKind,
    pub record: SyncRecord,
}

pub type ChangeSender = Sender<LocalChange>;

pub trait SynchronizableManager {
    fn collection_name(&self) -> String;
    fn record_type(&self) -> RecordType;

    fn is_initial_sync(&self) -> bool;
    fn set_is_initial_sync(&mut self, is_initial: bool);

    fn sync_time(&self) -> ServerTimestamp;
    fn set_sync_time(&mut self, sync_time: ServerTimestamp);

    /// Apply a record that arrived from the server to the local store.
    fn add(&mut self, record: SyncRecord);

    /// Remove the local counterpart of a record, without echoing a deletion
    /// back to the server.
    fn remove(&mut self, record: &SyncRecord);

    /// Persist a record whose server modification time was just refreshed.
    fn save(&mut self, record: &SyncRecord);

    /// The central three-way merge. Consumes the remote tombstones and
    /// updates for one sync pass and returns the records that must be
    /// (re)uploaded, in upload order.
    fn merge(
        &mut self,
        is_initial: bool,
        remotes_deleted: Vec<SyncRecord>,
        remotes_updated: Vec<SyncRecord>,
    ) -> Vec<SyncRecord>;

    fn connect_changes(&mut self, sender: ChangeSender);
    fn disconnect_changes(&mut self);
}
