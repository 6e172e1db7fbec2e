//! Setup map: the device's externally visible configuration.
//!
//! Some entries are backed by a hardware register.  On every poll the map is
//! reconciled against the register snapshot:
//!
//! - `forced = true` – the in-memory value is authoritative; a differing
//!   register is overwritten.
//! - `forced = false` – the register is authoritative; a local change (e.g.
//!   from a front panel) is accepted and must be republished.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::payload::SetupValues;

/// One configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupEntry {
    pub key: String,
    pub value: i64,
    #[serde(default)]
    pub register: Option<u16>,
    #[serde(default)]
    pub forced: bool,
}

/// Follow-up work produced by [`SetupMap::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupAction {
    /// A forced entry disagrees with hardware; write `value` to `register`.
    WriteRegister { register: u16, value: i64 },
    /// An unforced entry took the register's value.
    Accepted { key: String, value: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupMap {
    entries: BTreeMap<String, SetupEntry>,
}

impl SetupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: SetupEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&SetupEntry> {
        self.entries.get(key)
    }

    /// Overwrites the in-memory value.  Returns `false` for an unknown key.
    pub fn set(&mut self, key: &str, value: i64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Key → value view used for SETUP payloads.
    pub fn values(&self) -> SetupValues {
        self.entries
            .values()
            .map(|e| (e.key.clone(), e.value))
            .collect()
    }

    /// Compares every register-backed entry with `registers`.
    ///
    /// Unforced entries are updated in place; forced entries are left alone
    /// and reported as register writes.  Entries whose register is missing
    /// from the snapshot are skipped.
    pub fn reconcile(&mut self, registers: &HashMap<u16, i64>) -> Vec<SetupAction> {
        let mut actions = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(register) = entry.register else {
                continue;
            };
            let Some(&actual) = registers.get(&register) else {
                continue;
            };
            if actual == entry.value {
                continue;
            }
            debug!(
                key = entry.key.as_str(),
                register,
                expected = entry.value,
                actual,
                forced = entry.forced,
                "setup register differs"
            );
            if entry.forced {
                actions.push(SetupAction::WriteRegister {
                    register,
                    value: entry.value,
                });
            } else {
                entry.value = actual;
                actions.push(SetupAction::Accepted {
                    key: entry.key.clone(),
                    value: actual,
                });
            }
        }
        actions
    }
}

impl FromIterator<SetupEntry> for SetupMap {
    fn from_iter<I: IntoIterator<Item = SetupEntry>>(iter: I) -> Self {
        let mut map = SetupMap::new();
        for entry in iter {
            map.insert(entry);
        }
        map
    }
}
