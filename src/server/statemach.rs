//! Per-server key-value store and its command execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Command to the key-value store.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key, replacing the old one.
    Put { key: String, value: String },

    /// Append value to the end of key's current value.
    Append { key: String, value: String },
}

/// Command execution result returned by the store.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found in the store, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was in the store, else `None`.
    Put { old_value: Option<String> },

    /// `Some(old_value)` if key was in the store, else `None`.
    Append { old_value: Option<String> },
}

impl CommandResult {
    /// Value carried by the result: the current value for a Get, the value
    /// before the write for a Put or Append.
    pub fn into_value(self) -> Option<String> {
        match self {
            CommandResult::Get { value } => value,
            CommandResult::Put { old_value }
            | CommandResult::Append { old_value } => old_value,
        }
    }
}

/// Per-key write version, assigned by the key's primary.
pub type Version = u64;

/// One stored value and the version of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: String,
    version: Version,
}

/// The local volatile store, which is simply an in-memory `HashMap`. Not
/// thread-safe by itself; the owning server serializes access.
///
/// Every Put or Append executed here bumps the key's version by one. Values
/// installed from a primary carry the primary's version and only take
/// effect if newer than what is stored, so pushes arriving out of order
/// cannot roll a key back.
#[derive(Debug, Default)]
pub struct KvStore {
    /// HashMap from key -> versioned value.
    data: HashMap<String, Entry>,
}

impl KvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        KvStore {
            data: HashMap::new(),
        }
    }

    /// Executes given command on the store.
    pub fn execute(&mut self, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Get { key } => CommandResult::Get {
                value: self.get(key).cloned(),
            },
            Command::Put { key, value } => CommandResult::Put {
                old_value: self.write(key, |_| value.clone()),
            },
            Command::Append { key, value } => CommandResult::Append {
                old_value: self.write(key, |old| {
                    let mut new_value = old.to_string();
                    new_value.push_str(value);
                    new_value
                }),
            },
        }
    }

    /// Replaces key's value with `f(old value or "")` under the next
    /// version. Returns the old value.
    fn write(
        &mut self,
        key: &str,
        f: impl FnOnce(&str) -> String,
    ) -> Option<String> {
        let (old_value, version) = match self.data.get(key) {
            Some(entry) => (Some(entry.value.clone()), entry.version + 1),
            None => (None, 1),
        };
        let value = f(old_value.as_deref().unwrap_or(""));
        self.data.insert(key.into(), Entry { value, version });
        old_value
    }

    /// Current value of key, if any.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key).map(|entry| &entry.value)
    }

    /// Current value of key together with its version, if any.
    pub fn get_versioned(&self, key: &str) -> Option<(&String, Version)> {
        self.data.get(key).map(|entry| (&entry.value, entry.version))
    }

    /// Sets key to value if `version` is newer than the stored one. Returns
    /// whether the value was installed.
    pub fn install(
        &mut self,
        key: String,
        value: String,
        version: Version,
    ) -> bool {
        match self.data.get(&key) {
            Some(entry) if entry.version >= version => false,
            _ => {
                self.data.insert(key, Entry { value, version });
                true
            }
        }
    }
}
