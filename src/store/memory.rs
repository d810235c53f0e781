//! In-memory store backend: the reference semantics every driver must match.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::commit::Commit;
use crate::error::{Result, SyncError};
use crate::store::traits::{BackendOpener, StoreBackend};
use crate::store::{AddOutcome, CommitAck, CommitsEvent, RemoteSyncInfo};

pub struct MemoryBackend {
    local_store_id: String,
    /// Refs in insertion order; the index order mirrors local sync ids.
    order: Vec<String>,
    commits: HashMap<String, (u64, Commit)>,
    next_sync_id: u64,
    heads: BTreeSet<String>,
    claimed_as_parent: HashSet<String>,
    last_sync_cursor: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            local_store_id: uuid::Uuid::new_v4().to_string(),
            order: Vec::new(),
            commits: HashMap::new(),
            next_sync_id: 1,
            heads: BTreeSet::new(),
            claimed_as_parent: HashSet::new(),
            last_sync_cursor: None,
        }
    }

    fn current_cursor(&self) -> u64 {
        self.next_sync_id - 1
    }

    /// Current heads, lexicographic. Mostly useful to tests.
    pub fn heads(&self) -> Vec<String> {
        self.heads.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn check_parents(&self, commit: &Commit) -> Result<()> {
        let known = |r: &str| self.commits.contains_key(r);
        for parent in commit.parents() {
            if !known(parent) {
                return Err(SyncError::MissingParent {
                    commit: commit.ref_.clone(),
                    parent: parent.to_string(),
                });
            }
        }
        if let Some(base) = &commit.merge_base_ref {
            if !known(base) {
                return Err(SyncError::MissingParent {
                    commit: commit.ref_.clone(),
                    parent: base.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for MemoryBackend {
    fn add_commits(
        &mut self,
        commits: &[Commit],
        remote_sync_id: Option<&str>,
    ) -> Result<AddOutcome> {
        let mut refs = Vec::with_capacity(commits.len());
        let mut new_commits = Vec::new();

        for commit in commits {
            refs.push(commit.ref_.clone());

            if let Some((_, existing)) = self.commits.get_mut(&commit.ref_) {
                // Re-inserting a known ref with a cursor is an ack.
                if existing.remote_sync_id.is_none() {
                    if let Some(cursor) = remote_sync_id {
                        existing.remote_sync_id = Some(cursor.to_string());
                    }
                }
                continue;
            }

            commit.validate_shape()?;
            self.check_parents(commit)?;

            let mut stored = commit.clone();
            if stored.remote_sync_id.is_none() {
                stored.remote_sync_id = remote_sync_id.map(str::to_string);
            }

            for parent in stored.parents() {
                self.heads.remove(parent);
                self.claimed_as_parent.insert(parent.to_string());
            }
            if !self.claimed_as_parent.contains(&stored.ref_) {
                self.heads.insert(stored.ref_.clone());
            }

            let sync_id = self.next_sync_id;
            self.next_sync_id += 1;
            self.order.push(stored.ref_.clone());
            self.commits.insert(stored.ref_.clone(), (sync_id, stored.clone()));
            new_commits.push(stored);
        }

        if let Some(cursor) = remote_sync_id {
            self.last_sync_cursor = Some(cursor.to_string());
        }

        Ok(AddOutcome {
            ack: CommitAck {
                refs,
                sync_id: self.current_cursor(),
            },
            new_commits,
        })
    }

    fn acknowledge(&mut self, refs: &[String], remote_sync_id: &str) -> Result<CommitAck> {
        for ref_ in refs {
            if let Some((_, commit)) = self.commits.get_mut(ref_) {
                if commit.remote_sync_id.is_none() {
                    commit.remote_sync_id = Some(remote_sync_id.to_string());
                }
            }
        }
        self.last_sync_cursor = Some(remote_sync_id.to_string());
        Ok(CommitAck {
            refs: refs.to_vec(),
            sync_id: self.current_cursor(),
        })
    }

    fn commits_since(&mut self, since: Option<u64>) -> Result<CommitsEvent> {
        let since = since.unwrap_or(0);
        let commits = self
            .order
            .iter()
            .filter_map(|r| self.commits.get(r))
            .filter(|(sync_id, _)| *sync_id > since)
            .map(|(_, c)| c.clone())
            .collect();
        Ok(CommitsEvent {
            commits,
            sync_id: self.current_cursor(),
        })
    }

    fn commits_by_refs(&mut self, refs: &[String]) -> Result<Vec<Commit>> {
        Ok(refs
            .iter()
            .filter_map(|r| self.commits.get(r))
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn remote_sync_info(&mut self) -> Result<RemoteSyncInfo> {
        Ok(RemoteSyncInfo {
            local_store_id: self.local_store_id.clone(),
            last_sync_cursor: self.last_sync_cursor.clone(),
        })
    }

    fn next_unsynced_batch(&mut self, limit: usize) -> Result<Option<CommitsEvent>> {
        let commits: Vec<Commit> = self
            .order
            .iter()
            .filter_map(|r| self.commits.get(r))
            .filter(|(_, c)| c.remote_sync_id.is_none())
            .take(limit)
            .map(|(_, c)| c.clone())
            .collect();
        if commits.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CommitsEvent {
                commits,
                sync_id: self.current_cursor(),
            }))
        }
    }

    fn reset_remote_sync_data(&mut self) -> Result<()> {
        for (_, commit) in self.commits.values_mut() {
            commit.remote_sync_id = None;
        }
        self.last_sync_cursor = None;
        // A fresh store identity: the remote must not mistake the re-push for
        // a resumed session.
        self.local_store_id = uuid::Uuid::new_v4().to_string();
        Ok(())
    }

    fn cursor(&mut self) -> Result<u64> {
        Ok(self.current_cursor())
    }
}

// ============================================================================
// Opener
// ============================================================================

/// Opens one fresh in-memory backend per document id.
#[derive(Debug, Default)]
pub struct MemoryOpener;

impl BackendOpener for MemoryOpener {
    type Backend = MemoryBackend;

    fn open(&self, _doc_id: &str) -> Result<MemoryBackend> {
        Ok(MemoryBackend::new())
    }

    fn delete(&self, _doc_id: &str) -> Result<()> {
        // Nothing persisted; the factory drops the live instance.
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
