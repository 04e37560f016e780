//! Presence membership for a channel.
//!
//! The feed sends a full `presence_state` on join and `presence_diff`
//! updates afterwards. Both use the shape `{ key: { metas: [ {...} ] } }`
//! where each meta carries a `phx_ref` identifying one tracked session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence metas grouped by presence key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceState(BTreeMap<String, Vec<Value>>);

impl PresenceState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a `presence_state` payload.
    pub fn from_wire(payload: &Value) -> Self {
        let mut state = Self::new();
        for (key, metas) in wire_entries(payload) {
            if !metas.is_empty() {
                state.0.insert(key, metas);
            }
        }
        state
    }

    /// Apply a `presence_diff` payload (`{ joins, leaves }`).
    pub fn apply_diff(&mut self, payload: &Value) {
        if let Some(joins) = payload.get("joins") {
            for (key, metas) in wire_entries(joins) {
                let entry = self.0.entry(key).or_default();
                for meta in metas {
                    match phx_ref(&meta) {
                        Some(r) => {
                            entry.retain(|m| phx_ref(m) != Some(r));
                            entry.push(meta.clone());
                        }
                        None => entry.push(meta),
                    }
                }
            }
        }

        if let Some(leaves) = payload.get("leaves") {
            for (key, metas) in wire_entries(leaves) {
                let refs: Vec<&str> = metas.iter().filter_map(phx_ref).collect();
                if let Some(entry) = self.0.get_mut(&key) {
                    entry.retain(|m| phx_ref(m).is_none_or(|r| !refs.contains(&r)));
                    if entry.is_empty() {
                        self.0.remove(&key);
                    }
                }
            }
        }
    }

    /// Track or replace the metas for a key.
    pub fn insert(&mut self, key: impl Into<String>, metas: Vec<Value>) {
        self.0.insert(key.into(), metas);
    }

    /// Metas for a key.
    pub fn get(&self, key: &str) -> Option<&[Value]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Present keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of present keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nobody is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn wire_entries(payload: &Value) -> Vec<(String, Vec<Value>)> {
    let Some(map) = payload.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, entry)| {
            let metas = entry
                .get("metas")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (key.clone(), metas)
        })
        .collect()
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}
