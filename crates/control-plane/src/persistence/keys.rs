use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::api::{Cipher, Key};

use super::{DataError, Document};
use crate::tokens;

/// Length of the opaque public code attached to every key.
pub const KEY_CODE_LEN: usize = 32;

/// Operator-settable fields of a new key; id and code are assigned here.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub cipher: Cipher,
    pub secret: String,
    pub name: String,
    pub quota: u64,
    pub enabled: bool,
}

/// The durable key collection. Ids are `k-<n>` with a monotonically
/// increasing counter that is never rewound, not even after deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyTable {
    pub keys: Vec<Key>,
    pub next_id: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for KeyTable {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            next_id: 1,
            updated_at: None,
        }
    }
}

impl Document for KeyTable {
    const FILE: &'static str = "keys.json";

    fn validate(&self) -> Result<(), DataError> {
        if self.next_id < 1 {
            return Err(DataError::validation("next_id must be >= 1"));
        }
        let mut secrets = HashSet::new();
        let mut ids = HashSet::new();
        for key in &self.keys {
            key.validate().map_err(DataError::validation)?;
            if !ids.insert(key.id.as_str()) {
                return Err(DataError::validation(format!(
                    "duplicate key id {}",
                    key.id
                )));
            }
            if !secrets.insert(key.secret.as_str()) {
                return Err(DataError::validation(format!(
                    "the secret `{}` already exists",
                    key.secret
                )));
            }
        }
        Ok(())
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

impl KeyTable {
    pub fn find(&self, id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// Assign the next id and a fresh unique code, then append.
    pub fn store(&mut self, new: NewKey) -> Result<Key, DataError> {
        if let Some(existing) = self.keys.iter().find(|k| k.secret == new.secret) {
            return Err(DataError::validation(format!(
                "the secret `{}` already exists",
                existing.secret
            )));
        }

        let key = Key {
            id: format!("k-{}", self.next_id),
            code: self.generate_code(),
            cipher: new.cipher,
            secret: new.secret,
            name: new.name,
            quota: new.quota,
            enabled: new.enabled,
        };
        key.validate().map_err(DataError::validation)?;

        self.next_id += 1;
        self.keys.push(key.clone());
        Ok(key)
    }

    /// Update the mutable fields of an existing key; `None` when the id is
    /// unknown. The secret uniqueness check excludes the key itself.
    pub fn update(&mut self, key: Key) -> Result<Option<Key>, DataError> {
        if self
            .keys
            .iter()
            .any(|k| k.id != key.id && k.secret == key.secret)
        {
            return Err(DataError::validation(format!(
                "the secret `{}` already exists",
                key.secret
            )));
        }

        let Some(stored) = self.keys.iter_mut().find(|k| k.id == key.id) else {
            return Ok(None);
        };

        let candidate = Key {
            cipher: key.cipher,
            secret: key.secret,
            name: key.name,
            quota: key.quota,
            enabled: key.enabled,
            ..stored.clone()
        };
        candidate.validate().map_err(DataError::validation)?;

        *stored = candidate.clone();
        Ok(Some(candidate))
    }

    /// Remove a key; `false` when the id is unknown. The id is never reused.
    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k.id != id);
        self.keys.len() != before
    }

    /// Replace the whole set with a coordinator-pushed snapshot. Validates
    /// the incoming set as a whole before touching any state and derives the
    /// counter from the highest incoming ordinal.
    pub fn fill(&mut self, incoming: Vec<Key>) -> Result<(), DataError> {
        let mut max_ordinal: u64 = 0;
        for key in &incoming {
            key.validate().map_err(DataError::validation)?;
            if let Some(other) = incoming
                .iter()
                .find(|k| k.id != key.id && k.secret == key.secret)
            {
                return Err(DataError::validation(format!(
                    "the secret of {} and {} is `{}`",
                    key.id, other.id, key.secret
                )));
            }
            let ordinal = key
                .id
                .strip_prefix("k-")
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| {
                    DataError::validation(format!("invalid key id: {}", key.id))
                })?;
            max_ordinal = max_ordinal.max(ordinal);
        }

        self.keys = incoming;
        self.next_id = max_ordinal + 1;

        // Peers may push codeless keys; backfill so self-service links work.
        let missing: Vec<usize> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.code.is_empty())
            .map(|(i, _)| i)
            .collect();
        for index in missing {
            let code = self.generate_code();
            self.keys[index].code = code;
        }

        Ok(())
    }

    /// Draw random codes until one does not collide with any existing key.
    pub fn generate_code(&self) -> String {
        loop {
            let code = tokens::generate_token(KEY_CODE_LEN);
            if !self.keys.iter().any(|k| k.code == code) {
                return code;
            }
        }
    }
}
