//! Ephemeral per-client state (cursor, selection, identity).
//!
//! An update is a list of `(client_id, clock, state)` triples. States are JSON
//! objects merged per field: a field is overwritten only by a write carrying a
//! strictly greater clock. A `null` state drops every field written at or
//! before its clock, which removes the client once nothing newer is left.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;

use crate::models::messages::{BytesReader, BytesWriter, DecodeError};

#[derive(Debug, Clone)]
struct FieldValue {
    clock: u64,
    value: Value,
}

#[derive(Debug, Clone)]
struct ClientState {
    fields: HashMap<String, FieldValue>,
    last_updated: Instant,
}

impl ClientState {
    fn new() -> Self {
        Self {
            fields: HashMap::new(),
            last_updated: Instant::now(),
        }
    }

    fn to_json(&self) -> Value {
        let mut keys: Vec<&String> = self.fields.keys().collect();
        keys.sort();
        let mut obj = Map::new();
        for key in keys {
            obj.insert(key.clone(), self.fields[key].value.clone());
        }
        Value::Object(obj)
    }
}

/// Clients touched by an applied update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id mentioned by the update that produced these changes.
    pub fn touched(&self) -> impl Iterator<Item = u64> + '_ {
        self.added.iter().chain(self.updated.iter()).chain(self.removed.iter()).copied()
    }
}

#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<u64, ClientState>,
    // Highest clock seen per client, kept after removal so stale writes stay ignored.
    clocks: HashMap<u64, u64>,
    // Clock of the latest removal per client.
    tombstones: HashMap<u64, u64>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clock_of(&self, client_id: u64) -> u64 {
        self.clocks.get(&client_id).copied().unwrap_or(0)
    }

    pub fn get_state(&self, client_id: u64) -> Option<Value> {
        self.states.get(&client_id).map(ClientState::to_json)
    }

    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Writes fields for a client owned by this process and returns the
    /// encoded update describing the write.
    pub fn set_local_fields(&mut self, client_id: u64, fields: Map<String, Value>) -> Vec<u8> {
        let clock = self.clock_of(client_id) + 1;
        let state = Value::Object(fields);
        self.apply_entry(client_id, clock, &state, &mut AwarenessChanges::default());
        encode_entries(&[(client_id, clock, state)])
    }

    /// Removes clients owned by this process and returns the encoded removal,
    /// or `None` when none of them had state.
    pub fn remove_local(&mut self, client_ids: &[u64]) -> Option<Vec<u8>> {
        let mut entries = Vec::new();
        for &client_id in client_ids {
            if !self.states.contains_key(&client_id) {
                continue;
            }
            let clock = self.clock_of(client_id) + 1;
            self.apply_entry(client_id, clock, &Value::Null, &mut AwarenessChanges::default());
            entries.push((client_id, clock, Value::Null));
        }
        if entries.is_empty() {
            None
        } else {
            Some(encode_entries(&entries))
        }
    }

    /// Merges an encoded update received from a client or a peer instance.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChanges, DecodeError> {
        let entries = decode_entries(update)?;
        let mut changes = AwarenessChanges::default();
        for (client_id, clock, state) in entries {
            self.apply_entry(client_id, clock, &state, &mut changes);
        }
        Ok(changes)
    }

    /// Encodes the state of every known client.
    pub fn encode_all(&self) -> Vec<u8> {
        let ids = self.client_ids();
        self.encode_clients(&ids)
    }

    pub fn encode_clients(&self, client_ids: &[u64]) -> Vec<u8> {
        let entries: Vec<(u64, u64, Value)> = client_ids
            .iter()
            .filter_map(|id| {
                self.states
                    .get(id)
                    .map(|s| (*id, self.clock_of(*id), s.to_json()))
            })
            .collect();
        encode_entries(&entries)
    }

    /// Client ids whose state has not changed for longer than `max_idle`.
    pub fn stale_clients(&self, max_idle: std::time::Duration) -> Vec<u64> {
        let now = Instant::now();
        let mut ids: Vec<u64> = self
            .states
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_updated) > max_idle)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn apply_entry(&mut self, client_id: u64, clock: u64, state: &Value, changes: &mut AwarenessChanges) {
        let tombstone = self.tombstones.get(&client_id).copied();
        let seen = self.clocks.entry(client_id).or_insert(0);
        if clock > *seen {
            *seen = clock;
        }

        match state {
            Value::Null => {
                if tombstone.map_or(false, |t| t >= clock) {
                    return;
                }
                self.tombstones.insert(client_id, clock);
                let Some(current) = self.states.get_mut(&client_id) else {
                    return;
                };
                current.fields.retain(|_, f| f.clock > clock);
                if current.fields.is_empty() {
                    self.states.remove(&client_id);
                    changes.removed.push(client_id);
                } else {
                    current.last_updated = Instant::now();
                    changes.updated.push(client_id);
                }
            }
            Value::Object(fields) => {
                let floor = tombstone.unwrap_or(0);
                if clock <= floor {
                    return;
                }
                let existed = self.states.contains_key(&client_id);
                let current = self.states.entry(client_id).or_insert_with(ClientState::new);
                let mut changed = false;
                for (key, value) in fields {
                    let newer = current.fields.get(key).map_or(true, |f| clock > f.clock);
                    if newer {
                        current.fields.insert(key.clone(), FieldValue { clock, value: value.clone() });
                        changed = true;
                    }
                }
                if !existed {
                    if current.fields.is_empty() {
                        self.states.remove(&client_id);
                        return;
                    }
                    changes.added.push(client_id);
                } else if changed {
                    current.last_updated = Instant::now();
                    changes.updated.push(client_id);
                }
            }
            // Non-object states are not part of the protocol.
            _ => {}
        }
    }
}

fn encode_entries(entries: &[(u64, u64, Value)]) -> Vec<u8> {
    let mut w = BytesWriter::new();
    w.push_uleb128(entries.len() as u64);
    for (client_id, clock, state) in entries {
        w.push_uleb128(*client_id);
        w.push_uleb128(*clock);
        w.push_var_string(&state.to_string());
    }
    w.finish()
}

/// Parses an encoded update into `(client_id, clock, state)` triples.
pub fn decode_entries(update: &[u8]) -> Result<Vec<(u64, u64, Value)>, DecodeError> {
    let mut r = BytesReader::new(update);
    let count = r.read_uleb128()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client_id = r.read_uleb128()?;
        let clock = r.read_uleb128()?;
        let raw = r.read_var_string()?;
        let state = serde_json::from_str(raw).unwrap_or(Value::Null);
        entries.push((client_id, clock, state));
    }
    Ok(entries)
}

const USER_COLORS: [&str; 12] = [
    "#E57373", "#F06292", "#BA68C8", "#9575CD", "#7986CB", "#64B5F6",
    "#4FC3F7", "#4DB6AC", "#81C784", "#DCE775", "#FFB74D", "#A1887F",
];

/// Display color for a user, stable across processes and restarts.
pub fn user_color(user_id: &str) -> &'static str {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for b in user_id.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    USER_COLORS[(hash as usize) % USER_COLORS.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(entries: &[(u64, u64, Value)]) -> Vec<u8> {
        encode_entries(entries)
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn later_clock_wins_per_field() {
        let mut a = Awareness::new();
        a.apply_update(&update(&[(7, 1, json!({"cursor": 1, "name": "ann"}))])).unwrap();
        a.apply_update(&update(&[(7, 2, json!({"cursor": 5}))])).unwrap();
        // Stale write is ignored.
        a.apply_update(&update(&[(7, 1, json!({"cursor": 3}))])).unwrap();
        assert_eq!(a.get_state(7), Some(json!({"cursor": 5, "name": "ann"})));
    }

    #[test]
    fn delivery_order_does_not_matter() {
        let updates = vec![
            update(&[(1, 1, json!({"a": 1}))]),
            update(&[(1, 2, json!({"b": 2}))]),
            update(&[(1, 3, json!({"a": 3}))]),
            update(&[(2, 1, json!({"c": 1}))]),
            update(&[(2, 2, Value::Null)]),
        ];
        let mut forward = Awareness::new();
        for u in &updates {
            forward.apply_update(u).unwrap();
        }
        let mut backward = Awareness::new();
        for u in updates.iter().rev() {
            backward.apply_update(u).unwrap();
        }
        assert_eq!(forward.encode_all(), backward.encode_all());
        assert_eq!(forward.get_state(1), Some(json!({"a": 3, "b": 2})));
        assert_eq!(forward.get_state(2), None);
    }

    #[test]
    fn removal_keeps_newer_fields() {
        let mut a = Awareness::new();
        a.apply_update(&update(&[(3, 6, json!({"cursor": 6}))])).unwrap();
        let changes = a.apply_update(&update(&[(3, 5, Value::Null)])).unwrap();
        assert!(changes.removed.is_empty());
        assert_eq!(a.get_state(3), Some(json!({"cursor": 6})));

        let changes = a.apply_update(&update(&[(3, 7, Value::Null)])).unwrap();
        assert_eq!(changes.removed, vec![3]);
        // Writes older than the removal cannot resurrect the client.
        a.apply_update(&update(&[(3, 7, json!({"cursor": 1}))])).unwrap();
        assert!(a.is_empty());
    }

    #[test]
    fn local_writes_bump_the_clock() {
        let mut a = Awareness::new();
        let first = a.set_local_fields(9, obj(json!({"userId": "u1"})));
        let second = a.set_local_fields(9, obj(json!({"cursor": 2})));
        assert_eq!(decode_entries(&first).unwrap()[0].1, 1);
        assert_eq!(decode_entries(&second).unwrap()[0].1, 2);

        let mut peer = Awareness::new();
        peer.apply_update(&second).unwrap();
        peer.apply_update(&first).unwrap();
        assert_eq!(peer.get_state(9), a.get_state(9));

        let removal = a.remove_local(&[9, 10]).unwrap();
        assert_eq!(decode_entries(&removal).unwrap(), vec![(9, 3, Value::Null)]);
        let changes = peer.apply_update(&removal).unwrap();
        assert_eq!(changes.removed, vec![9]);
        assert!(a.remove_local(&[9]).is_none());
    }

    #[test]
    fn truncated_update_is_an_error() {
        let mut bytes = update(&[(1, 1, json!({"a": 1}))]);
        bytes.truncate(bytes.len() - 2);
        assert!(Awareness::new().apply_update(&bytes).is_err());
    }

    #[test]
    fn colors_are_deterministic() {
        assert_eq!(user_color("user-42"), user_color("user-42"));
        assert!(USER_COLORS.contains(&user_color("")));
    }
}
