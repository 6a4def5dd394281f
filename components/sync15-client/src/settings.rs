/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The typed key/value settings the sync core persists outside of itself.
//! The embedding browser supplies the real store; `MemorySettings` backs the
//! tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const SYNC_USER: &'static str = "sync.user";
/// Minutes between periodic syncs.
pub const SYNC_FREQUENCY: &'static str = "sync.frequency";
pub const SYNC_CLIENT_ID: &'static str = "sync.client-id";
pub const SYNC_DEVICE_NAME: &'static str = "sync.device-name";
/// When false, collections are synced under an app-private namespace
/// instead of the Firefox ones.
pub const SYNC_WITH_FIREFOX: &'static str = "sync.with-firefox";

pub const DEFAULT_SYNC_FREQUENCY_MINUTES: u64 = 30;

pub fn sync_time_key(collection: &str) -> String {
    format!("{}-sync-time", collection)
}

pub fn is_initial_key(collection: &str) -> String {
    format!("{}-sync-is-initial", collection)
}

pub trait SettingsStore {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&mut self, key: &str, value: &str);
    fn get_uint(&self, key: &str) -> Option<u64>;
    fn set_uint(&mut self, key: &str, value: u64);
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&mut self, key: &str, value: bool);
    fn get_double(&self, key: &str) -> Option<f64>;
    fn set_double(&mut self, key: &str, value: f64);
}

/// The settings store is shared between the service and every manager; all
/// of them live on the same thread.
pub type SharedSettings = Rc<RefCell<SettingsStore>>;

#[derive(Debug, Clone, PartialEq)]
enum SettingValue {
    Str(String),
    Uint(u64),
    Bool(bool),
    Double(f64),
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: HashMap<String, SettingValue>,
}

impl MemorySettings {
    pub fn new() -> MemorySettings {
        MemorySettings::default()
    }

    pub fn new_shared() -> SharedSettings {
        Rc::new(RefCell::new(MemorySettings::new()))
    }
}

impl SettingsStore for MemorySettings {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some(&SettingValue::Str(ref value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), SettingValue::Str(value.to_string()));
    }

    fn get_uint(&self, key: &str) -> Option<u64> {
        match self.values.get(key) {
            Some(&SettingValue::Uint(value)) => Some(value),
            _ => None,
        }
    }

    fn set_uint(&mut self, key: &str, value: u64) {
        self.values.insert(key.to_string(), SettingValue::Uint(value));
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(&SettingValue::Bool(value)) => Some(value),
            _ => None,
        }
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), SettingValue::Bool(value));
    }

    fn get_double(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(&SettingValue::Double(value)) => Some(value),
            _ => None,
        }
    }

    fn set_double(&mut self, key: &str, value: f64) {
        self.values
            .insert(key.to_string(), SettingValue::Double(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_settings() {
        let mut settings = MemorySettings::new();
        assert_eq!(settings.get_string(SYNC_USER), None);
        settings.set_string(SYNC_USER, "user@example.com");
        assert_eq!(
            settings.get_string(SYNC_USER),
            Some("user@example.com".to_string())
        );

        settings.set_uint(SYNC_FREQUENCY, 15);
        assert_eq!(settings.get_uint(SYNC_FREQUENCY), Some(15));
        // Wrong-typed reads miss instead of panicking.
        assert_eq!(settings.get_bool(SYNC_FREQUENCY), None);

        settings.set_double(&sync_time_key("history"), 1234.56);
        assert_eq!(
            settings.get_double(&sync_time_key("history")),
            Some(1234.56)
        );
        settings.set_bool(&is_initial_key("history"), false);
        assert_eq!(settings.get_bool(&is_initial_key("history")), Some(false));
    }
}
