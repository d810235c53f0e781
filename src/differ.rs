//! The pure diff/patch/merge/hash seam.
//!
//! Everything the engine knows about document contents goes through this
//! trait: the core never interprets deltas or metadata, and the in-memory
//! document type is whatever the differ says it is.

use crate::error::Result;

/// A materialized document for one commit: the document value plus the edit
/// metadata that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitDoc<T> {
    pub doc: T,
    pub metadata: Vec<u8>,
}

/// Outcome of a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<T> {
    pub doc: T,
    pub metadata: Vec<u8>,
    /// Advisory merge: shown to the user while offline, never committed.
    pub temp: bool,
}

/// Pure document algebra. No I/O, no interior state, no concurrency.
///
/// `compute_ref` must be deterministic and collision-resistant over the
/// inputs observed in practice; two clients that build the same commit from
/// the same parents and payload must produce the same ref.
pub trait Differ: Send + Sync + 'static {
    type Doc: Clone + PartialEq + Send + Sync + 'static;

    /// Rewrite an older persisted document on load.
    fn migrate(&self, doc: Self::Doc, metadata: Vec<u8>) -> (Self::Doc, Vec<u8>);

    /// `None` means no change.
    fn diff(&self, old: Option<&Self::Doc>, new: &Self::Doc) -> Option<Vec<u8>>;

    /// Apply a delta. `doc` is `None` when patching from the empty state
    /// (root commits). A `None` delta leaves the document unchanged.
    fn patch(&self, doc: Option<&Self::Doc>, delta: Option<&[u8]>) -> Result<Self::Doc>;

    /// Derive the content-addressed ref for a commit.
    fn compute_ref(
        &self,
        base_ref: Option<&str>,
        merge_ref: Option<&str>,
        merge_base_ref: Option<&str>,
        delta: Option<&[u8]>,
        metadata: &[u8],
    ) -> String;

    /// Three-way merge. `base` is `None` when the two histories share no
    /// common ancestor.
    fn merge(
        &self,
        base: Option<&CommitDoc<Self::Doc>>,
        left: &CommitDoc<Self::Doc>,
        right: &CommitDoc<Self::Doc>,
    ) -> Result<MergeResult<Self::Doc>>;
}
