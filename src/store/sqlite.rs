//! SQLite driver for the commit log.
//!
//! One database file per document id: a `commits` table keyed by ref with an
//! auto-incrementing local sync id, a `heads` table, and a single-row
//! `remotes` table holding the store identity and last acknowledged cursor.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::commit::Commit;
use crate::error::{Result, SyncError};
use crate::store::traits::{BackendOpener, StoreBackend};
use crate::store::{AddOutcome, CommitAck, CommitsEvent, RemoteSyncInfo};

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let backend = Self { conn };
        backend.initialize()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self { conn };
        backend.initialize()?;
        Ok(backend)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS commits (
                local_sync_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                "ref"           TEXT NOT NULL UNIQUE,
                remote_sync_id  TEXT,
                user_id         TEXT NOT NULL,
                client_id       TEXT NOT NULL,
                base_ref        TEXT,
                merge_ref       TEXT,
                merge_base_ref  TEXT,
                delta           BLOB,
                edit_metadata   BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS heads (
                "ref" TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS remotes (
                local_store_id   TEXT NOT NULL,
                last_sync_cursor TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_commits_unsynced
                ON commits (local_sync_id) WHERE remote_sync_id IS NULL;
            "#,
        )?;
        Ok(())
    }

    fn cursor_of(conn: &Connection) -> Result<u64> {
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(local_sync_id), 0) FROM commits",
            [],
            |row| row.get(0),
        )?;
        Ok(id as u64)
    }

    fn commit_exists(tx: &Transaction<'_>, ref_: &str) -> Result<bool> {
        let found: Option<i64> = tx
            .query_row(
                r#"SELECT 1 FROM commits WHERE "ref" = ?1"#,
                params![ref_],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn ensure_remotes_row(conn: &Connection) -> Result<RemoteSyncInfo> {
        let existing: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT local_store_id, last_sync_cursor FROM remotes LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((local_store_id, last_sync_cursor)) = existing {
            return Ok(RemoteSyncInfo {
                local_store_id,
                last_sync_cursor,
            });
        }
        let local_store_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO remotes (local_store_id, last_sync_cursor) VALUES (?1, NULL)",
            params![local_store_id],
        )?;
        Ok(RemoteSyncInfo {
            local_store_id,
            last_sync_cursor: None,
        })
    }

    fn set_cursor(conn: &Connection, cursor: &str) -> Result<()> {
        Self::ensure_remotes_row(conn)?;
        conn.execute(
            "UPDATE remotes SET last_sync_cursor = ?1",
            params![cursor],
        )?;
        Ok(())
    }

    fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
        Ok(Commit {
            ref_: row.get("ref")?,
            base_ref: row.get("base_ref")?,
            merge_ref: row.get("merge_ref")?,
            merge_base_ref: row.get("merge_base_ref")?,
            delta: row.get("delta")?,
            edit_metadata: row.get("edit_metadata")?,
            user_id: row.get("user_id")?,
            client_id: row.get("client_id")?,
            remote_sync_id: row.get("remote_sync_id")?,
        })
    }

    fn select_commits(conn: &Connection, where_clause: &str, limit: Option<usize>) -> Result<Vec<Commit>> {
        let mut sql = format!(
            r#"SELECT "ref", remote_sync_id, user_id, client_id, base_ref, merge_ref,
                      merge_base_ref, delta, edit_metadata
               FROM commits {where_clause} ORDER BY local_sync_id"#
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Self::row_to_commit(row))?;
        let mut commits = Vec::new();
        for row in rows {
            commits.push(row?);
        }
        Ok(commits)
    }
}

impl StoreBackend for SqliteBackend {
    fn add_commits(
        &mut self,
        commits: &[Commit],
        remote_sync_id: Option<&str>,
    ) -> Result<AddOutcome> {
        let tx = self.conn.transaction()?;
        let mut refs = Vec::with_capacity(commits.len());
        let mut new_commits = Vec::new();

        for commit in commits {
            refs.push(commit.ref_.clone());

            if Self::commit_exists(&tx, &commit.ref_)? {
                if let Some(cursor) = remote_sync_id {
                    tx.execute(
                        r#"UPDATE commits SET remote_sync_id = ?1
                           WHERE "ref" = ?2 AND remote_sync_id IS NULL"#,
                        params![cursor, commit.ref_],
                    )?;
                }
                continue;
            }

            commit.validate_shape()?;
            for parent in commit
                .parents()
                .chain(commit.merge_base_ref.as_deref())
            {
                if !Self::commit_exists(&tx, parent)? {
                    return Err(SyncError::MissingParent {
                        commit: commit.ref_.clone(),
                        parent: parent.to_string(),
                    });
                }
            }

            let mut stored = commit.clone();
            if stored.remote_sync_id.is_none() {
                stored.remote_sync_id = remote_sync_id.map(str::to_string);
            }

            tx.execute(
                r#"INSERT INTO commits
                   ("ref", remote_sync_id, user_id, client_id, base_ref, merge_ref,
                    merge_base_ref, delta, edit_metadata)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    stored.ref_,
                    stored.remote_sync_id,
                    stored.user_id,
                    stored.client_id,
                    stored.base_ref,
                    stored.merge_ref,
                    stored.merge_base_ref,
                    stored.delta,
                    stored.edit_metadata,
                ],
            )?;

            for parent in stored.parents() {
                tx.execute(r#"DELETE FROM heads WHERE "ref" = ?1"#, params![parent])?;
            }
            let claimed: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM commits WHERE base_ref = ?1 OR merge_ref = ?1 LIMIT 1",
                    params![stored.ref_],
                    |row| row.get(0),
                )
                .optional()?;
            if claimed.is_none() {
                tx.execute(
                    r#"INSERT OR IGNORE INTO heads ("ref") VALUES (?1)"#,
                    params![stored.ref_],
                )?;
            }

            new_commits.push(stored);
        }

        if let Some(cursor) = remote_sync_id {
            Self::set_cursor(&tx, cursor)?;
        }

        tx.commit()?;
        Ok(AddOutcome {
            ack: CommitAck {
                refs,
                sync_id: Self::cursor_of(&self.conn)?,
            },
            new_commits,
        })
    }

    fn acknowledge(&mut self, refs: &[String], remote_sync_id: &str) -> Result<CommitAck> {
        let tx = self.conn.transaction()?;
        for ref_ in refs {
            tx.execute(
                r#"UPDATE commits SET remote_sync_id = ?1
                   WHERE "ref" = ?2 AND remote_sync_id IS NULL"#,
                params![remote_sync_id, ref_],
            )?;
        }
        Self::set_cursor(&tx, remote_sync_id)?;
        tx.commit()?;
        Ok(CommitAck {
            refs: refs.to_vec(),
            sync_id: Self::cursor_of(&self.conn)?,
        })
    }

    fn commits_since(&mut self, since: Option<u64>) -> Result<CommitsEvent> {
        let since = since.unwrap_or(0);
        let commits = Self::select_commits(
            &self.conn,
            &format!("WHERE local_sync_id > {since}"),
            None,
        )?;
        Ok(CommitsEvent {
            commits,
            sync_id: Self::cursor_of(&self.conn)?,
        })
    }

    fn commits_by_refs(&mut self, refs: &[String]) -> Result<Vec<Commit>> {
        let mut commits = Vec::with_capacity(refs.len());
        let mut stmt = self.conn.prepare(
            r#"SELECT "ref", remote_sync_id, user_id, client_id, base_ref, merge_ref,
                      merge_base_ref, delta, edit_metadata
               FROM commits WHERE "ref" = ?1"#,
        )?;
        for ref_ in refs {
            if let Some(commit) = stmt
                .query_row(params![ref_], |row| Self::row_to_commit(row))
                .optional()?
            {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    fn remote_sync_info(&mut self) -> Result<RemoteSyncInfo> {
        Self::ensure_remotes_row(&self.conn)
    }

    fn next_unsynced_batch(&mut self, limit: usize) -> Result<Option<CommitsEvent>> {
        let commits = Self::select_commits(
            &self.conn,
            "WHERE remote_sync_id IS NULL",
            Some(limit),
        )?;
        if commits.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CommitsEvent {
                sync_id: Self::cursor_of(&self.conn)?,
                commits,
            }))
        }
    }

    fn reset_remote_sync_data(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("UPDATE commits SET remote_sync_id = NULL", [])?;
        tx.execute("DELETE FROM remotes", [])?;
        tx.commit()?;
        Ok(())
    }

    fn cursor(&mut self) -> Result<u64> {
        Self::cursor_of(&self.conn)
    }
}

// ============================================================================
// Opener
// ============================================================================

/// Opens one database file per document id under a base directory.
pub struct SqliteOpener {
    dir: PathBuf,
}

impl SqliteOpener {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn db_path(&self, doc_id: &str) -> PathBuf {
        self.dir.join(format!("{doc_id}.db"))
    }
}

impl BackendOpener for SqliteOpener {
    type Backend = SqliteBackend;

    fn open(&self, doc_id: &str) -> Result<SqliteBackend> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SyncError::Storage(format!("create store dir: {e}")))?;
        SqliteBackend::open(&self.db_path(doc_id))
    }

    fn delete(&self, doc_id: &str) -> Result<()> {
        match std::fs::remove_file(self.db_path(doc_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Storage(format!("delete store: {e}"))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
