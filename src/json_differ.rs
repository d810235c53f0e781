//! A ready-to-use differ over `serde_json::Value`.
//!
//! Deltas are whole-document snapshots; merges are recursive three-way
//! key-union over objects. Refs are truncated URL-safe base64 of a SHA-256
//! over the commit's content. The engine never depends on this module; it
//! exists so the crate works out of the box and tests exercise real merges.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::differ::{CommitDoc, Differ, MergeResult};
use crate::error::{Result, SyncError};

/// Length of generated refs. 16 base64 chars = 96 bits of digest.
const REF_LEN: usize = 16;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDiffer;

impl JsonDiffer {
    pub fn new() -> Self {
        Self
    }
}

impl Differ for JsonDiffer {
    type Doc = Value;

    fn migrate(&self, doc: Value, metadata: Vec<u8>) -> (Value, Vec<u8>) {
        (doc, metadata)
    }

    fn diff(&self, old: Option<&Value>, new: &Value) -> Option<Vec<u8>> {
        if old == Some(new) {
            return None;
        }
        Some(serde_json::to_vec(new).expect("Value serialization is infallible"))
    }

    fn patch(&self, doc: Option<&Value>, delta: Option<&[u8]>) -> Result<Value> {
        match delta {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => doc.cloned().ok_or_else(|| {
                SyncError::Protocol("empty delta with no base document".to_string())
            }),
        }
    }

    fn compute_ref(
        &self,
        base_ref: Option<&str>,
        merge_ref: Option<&str>,
        merge_base_ref: Option<&str>,
        delta: Option<&[u8]>,
        metadata: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hash_part(&mut hasher, base_ref.map(str::as_bytes));
        hash_part(&mut hasher, merge_ref.map(str::as_bytes));
        hash_part(&mut hasher, merge_base_ref.map(str::as_bytes));
        hash_part(&mut hasher, delta);
        hash_part(&mut hasher, Some(metadata));
        let digest = hasher.finalize();
        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(REF_LEN);
        encoded
    }

    fn merge(
        &self,
        base: Option<&CommitDoc<Value>>,
        left: &CommitDoc<Value>,
        right: &CommitDoc<Value>,
    ) -> Result<MergeResult<Value>> {
        let merged = merge_values(base.map(|b| &b.doc), &left.doc, &right.doc);
        Ok(MergeResult {
            doc: merged,
            metadata: b"\"merge\"".to_vec(),
            temp: false,
        })
    }
}

/// Unambiguous framing: presence tag + length + bytes per field.
fn hash_part(hasher: &mut Sha256, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            hasher.update([1u8]);
            hasher.update((b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
        None => hasher.update([0u8]),
    }
}

/// Recursive three-way merge.
///
/// Objects merge by key union. For a key changed on only one side, that side
/// wins; changed on both sides, objects recurse and anything else takes the
/// left value.
fn merge_values(base: Option<&Value>, left: &Value, right: &Value) -> Value {
    if left == right {
        return left.clone();
    }
    if Some(left) == base {
        return right.clone();
    }
    if Some(right) == base {
        return left.clone();
    }
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let empty = Map::new();
            let b = match base {
                Some(Value::Object(b)) => b,
                _ => &empty,
            };
            let mut merged = Map::new();
            for (key, lv) in l {
                match r.get(key) {
                    Some(rv) => {
                        merged.insert(key.clone(), merge_values(b.get(key), lv, rv));
                    }
                    None => {
                        // Present on the left only: deleted on the right, or
                        // added on the left.
                        if b.get(key) != Some(lv) {
                            merged.insert(key.clone(), lv.clone());
                        }
                    }
                }
            }
            for (key, rv) in r {
                if !l.contains_key(key) && b.get(key) != Some(rv) {
                    merged.insert(key.clone(), rv.clone());
                }
            }
            Value::Object(merged)
        }
        _ => left.clone(),
    }
}
