//! Transient per-client presence: cursors, selections, status.
//!
//! Presence never enters the commit DAG and is never persisted; it rides the
//! broadcast channel between co-resident clients and, through the leader, to
//! the remote.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One client's announced presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub client_id: String,
    /// Head ref the client was on when it announced, when known.
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
    /// Opaque application payload (cursor position, selection, ...).
    pub presence: Option<Value>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            ref_: None,
            presence: None,
        }
    }
}

/// Roster of currently-known clients, self included. Ordered by client id so
/// subscribers see a stable listing.
#[derive(Debug, Default)]
pub struct ClientList {
    clients: BTreeMap<String, PresenceRecord>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a client's record. Returns `true` when the roster
    /// actually changed.
    pub fn upsert(&mut self, record: PresenceRecord) -> bool {
        match self.clients.get(&record.client_id) {
            Some(existing) if *existing == record => false,
            _ => {
                self.clients.insert(record.client_id.clone(), record);
                true
            }
        }
    }

    /// Drop a departed client. Returns `true` when it was present.
    pub fn remove(&mut self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.clients.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_reports_changes_only() {
        let mut list = ClientList::new();
        let rec = PresenceRecord::new("u1", "c1");
        assert!(list.upsert(rec.clone()));
        assert!(!list.upsert(rec.clone()));

        let mut updated = rec;
        updated.presence = Some(json!({"cursor": 4}));
        assert!(list.upsert(updated));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_departed_client() {
        let mut list = ClientList::new();
        list.upsert(PresenceRecord::new("u1", "c1"));
        assert!(list.remove("c1"));
        assert!(!list.remove("c1"));
        assert!(list.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_client_id() {
        let mut list = ClientList::new();
        list.upsert(PresenceRecord::new("u1", "c2"));
        list.upsert(PresenceRecord::new("u1", "c1"));
        let ids: Vec<_> = list.snapshot().into_iter().map(|r| r.client_id).collect();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }
}
