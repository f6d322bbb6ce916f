// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use blake3::Hasher;

use crate::blob_store::BlobStore;
use crate::error::{Result, StoreError};
use crate::fs_store::{FsRootsIndex, TreeEntry};
use crate::turn_store::{AppendOutcome, ContextHead, TurnMeta, TurnRecord, TurnStore};

#[derive(Debug, Clone)]
pub struct TurnWithMeta {
    pub record: TurnRecord,
    pub meta: TurnMeta,
    pub payload: Option<Vec<u8>>,
}

/// Composes the three durable subsystems (blob CAS, turn DAG, filesystem
/// snapshots) into the single entity the protocol and HTTP handlers talk to.
///
/// Every method takes `&self`: each subsystem owns its own locking, so a
/// `Store` can be shared across connection-handling threads behind a plain
/// `Arc` with no outer mutex.
pub struct Store {
    pub blob_store: BlobStore,
    pub turn_store: TurnStore,
    pub fs_roots: FsRootsIndex,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            blob_store: BlobStore::open(&dir.join("blobs"))?,
            turn_store: TurnStore::open(&dir.join("turns"))?,
            fs_roots: FsRootsIndex::open(&dir.join("fs"))?,
        })
    }

    pub fn create_context(&self, base_turn_id: u64) -> Result<ContextHead> {
        self.turn_store.create_context(base_turn_id)
    }

    pub fn fork_context(&self, base_turn_id: u64) -> Result<ContextHead> {
        self.turn_store.fork_context(base_turn_id)
    }

    pub fn get_head(&self, context_id: u64) -> Result<ContextHead> {
        self.turn_store.get_head(context_id)
    }

    /// Append a turn to a context.
    ///
    /// Decompresses the wire payload (if compressed), verifies its declared
    /// length and BLAKE3 hash, stores the blob, then appends the turn. A
    /// non-empty `idempotency_key` makes a repeated call with the same
    /// `(context_id, idempotency_key)` return the original result verbatim.
    #[allow(clippy::too_many_arguments)]
    pub fn append_turn(
        &self,
        context_id: u64,
        parent_turn_id: u64,
        declared_type_id: String,
        declared_type_version: u32,
        encoding: u32,
        compression: u32,
        uncompressed_len: u32,
        content_hash: [u8; 32],
        payload_bytes: &[u8],
        idempotency_key: &str,
    ) -> Result<AppendOutcome> {
        let raw_bytes = match compression {
            0 => payload_bytes.to_vec(),
            1 => zstd::decode_all(payload_bytes)
                .map_err(|e| StoreError::InvalidInput(format!("zstd decode failed: {e}")))?,
            other => {
                return Err(StoreError::InvalidInput(format!(
                    "unsupported compression: {other}"
                )))
            }
        };

        if raw_bytes.len() as u32 != uncompressed_len {
            return Err(StoreError::InvalidInput(
                "uncompressed length mismatch".into(),
            ));
        }

        let mut hasher = Hasher::new();
        hasher.update(&raw_bytes);
        let hash = hasher.finalize();
        if hash.as_bytes() != &content_hash {
            return Err(StoreError::InvalidInput("content hash mismatch".into()));
        }

        self.blob_store.put_if_absent(content_hash, &raw_bytes)?;

        self.turn_store.append_turn(
            context_id,
            parent_turn_id,
            content_hash,
            encoding,
            declared_type_id,
            declared_type_version,
            compression,
            uncompressed_len,
            idempotency_key,
        )
    }

    pub fn get_last(
        &self,
        context_id: u64,
        limit: u32,
        include_payload: bool,
    ) -> Result<Vec<TurnWithMeta>> {
        let turns = self.turn_store.get_last(context_id, limit)?;
        self.attach_meta_and_payload(turns, include_payload)
    }

    pub fn get_before(
        &self,
        context_id: u64,
        before_turn_id: u64,
        limit: u32,
        include_payload: bool,
    ) -> Result<Vec<TurnWithMeta>> {
        let turns = self
            .turn_store
            .get_before(context_id, before_turn_id, limit)?;
        self.attach_meta_and_payload(turns, include_payload)
    }

    fn attach_meta_and_payload(
        &self,
        turns: Vec<TurnRecord>,
        include_payload: bool,
    ) -> Result<Vec<TurnWithMeta>> {
        let mut out = Vec::with_capacity(turns.len());
        for record in turns {
            let meta = self.turn_store.get_turn_meta(record.turn_id)?;
            let payload = if include_payload {
                Some(self.blob_store.get(&record.payload_hash)?)
            } else {
                None
            };
            out.push(TurnWithMeta {
                record,
                meta,
                payload,
            });
        }
        Ok(out)
    }

    pub fn get_blob(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        self.blob_store.get(hash)
    }

    pub fn list_recent_contexts(&self, limit: u32) -> Vec<ContextHead> {
        self.turn_store.list_recent_contexts(limit)
    }

    /// Attach a filesystem snapshot to a turn.
    ///
    /// The referenced tree does not need to be materialized in the CAS yet;
    /// the client may upload tree/file blobs separately. Only the turn
    /// itself must exist.
    pub fn attach_fs(&self, turn_id: u64, fs_root_hash: [u8; 32]) -> Result<()> {
        let _ = self.turn_store.get_turn(turn_id)?;
        self.fs_roots.attach(turn_id, fs_root_hash)
    }

    /// Get the filesystem root hash for a turn (direct or inherited).
    pub fn get_fs_root(&self, turn_id: u64) -> Option<[u8; 32]> {
        self.fs_roots.get_inherited(turn_id, &self.turn_store)
    }

    /// Get the filesystem root hash directly attached to a turn (no inheritance).
    pub fn get_fs_root_direct(&self, turn_id: u64) -> Option<[u8; 32]> {
        self.fs_roots.get(turn_id)
    }

    /// List entries at a path in the filesystem snapshot for a turn.
    pub fn list_fs_entries(&self, turn_id: u64, path: &str) -> Result<Vec<TreeEntry>> {
        let fs_root = self
            .fs_roots
            .get_inherited(turn_id, &self.turn_store)
            .ok_or_else(|| StoreError::NotFound("no fs snapshot for turn".into()))?;

        let (tree_hash, is_dir) = crate::fs_store::resolve_path(&self.blob_store, &fs_root, path)?;

        if !is_dir {
            return Err(StoreError::InvalidInput(format!(
                "path is not a directory: {path}"
            )));
        }

        crate::fs_store::load_tree_entries(&self.blob_store, &tree_hash)
    }

    /// Get file content at a path in the filesystem snapshot for a turn.
    pub fn get_fs_file(&self, turn_id: u64, path: &str) -> Result<(Vec<u8>, TreeEntry)> {
        let fs_root = self
            .fs_roots
            .get_inherited(turn_id, &self.turn_store)
            .ok_or_else(|| StoreError::NotFound("no fs snapshot for turn".into()))?;

        crate::fs_store::get_file_at_path(&self.blob_store, &fs_root, path)
    }

    pub fn stats(&self) -> StoreStats {
        let blob_stats = self.blob_store.stats();
        let turn_stats = self.turn_store.stats();
        let fs_stats = self.fs_roots.stats();
        let fs_content_bytes = self.compute_fs_content_bytes();
        StoreStats {
            turns_total: turn_stats.turns_total,
            contexts_total: turn_stats.contexts_total,
            heads_total: turn_stats.heads_total,
            blobs_total: blob_stats.blobs_total,
            turns_log_bytes: turn_stats.turns_log_bytes,
            turns_index_bytes: turn_stats.turns_index_bytes,
            turns_meta_bytes: turn_stats.turns_meta_bytes,
            heads_table_bytes: turn_stats.heads_table_bytes,
            blobs_pack_bytes: blob_stats.pack_bytes,
            blobs_index_bytes: blob_stats.idx_bytes,
            fs_roots_total: fs_stats.entries_total,
            fs_roots_bytes: fs_stats.file_bytes,
            fs_content_bytes,
        }
    }

    /// Compute the total size of all blobs referenced by filesystem snapshots.
    /// Traverses all unique filesystem root trees and sums raw blob sizes.
    fn compute_fs_content_bytes(&self) -> u64 {
        use std::collections::HashSet;

        let unique_roots = self.fs_roots.unique_roots();
        if unique_roots.is_empty() {
            return 0;
        }

        let mut visited: HashSet<[u8; 32]> = HashSet::new();
        let mut total_bytes: u64 = 0;

        for root_hash in unique_roots {
            total_bytes += self.compute_tree_size(&root_hash, &mut visited);
        }

        total_bytes
    }

    fn compute_tree_size(
        &self,
        tree_hash: &[u8; 32],
        visited: &mut std::collections::HashSet<[u8; 32]>,
    ) -> u64 {
        if !visited.insert(*tree_hash) {
            return 0;
        }

        let tree_size = self.blob_store.raw_len(tree_hash).unwrap_or(0) as u64;

        let entries = match crate::fs_store::load_tree_entries(&self.blob_store, tree_hash) {
            Ok(e) => e,
            Err(_) => return tree_size,
        };

        let mut total = tree_size;

        for entry in entries {
            if let Ok(hash) = entry.hash_array() {
                if entry.kind == crate::fs_store::ENTRY_KIND_DIR {
                    total += self.compute_tree_size(&hash, visited);
                } else if visited.insert(hash) {
                    total += self.blob_store.raw_len(&hash).unwrap_or(0) as u64;
                }
            }
        }

        total
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub turns_total: usize,
    pub contexts_total: usize,
    pub heads_total: usize,
    pub blobs_total: usize,
    pub turns_log_bytes: u64,
    pub turns_index_bytes: u64,
    pub turns_meta_bytes: u64,
    pub heads_table_bytes: u64,
    pub blobs_pack_bytes: u64,
    pub blobs_index_bytes: u64,
    pub fs_roots_total: usize,
    pub fs_roots_bytes: u64,
    pub fs_content_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_payload() -> Vec<u8> {
        b"hello, this is a turn payload".to_vec()
    }

    #[test]
    fn append_and_fork() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let ctx = store.create_context(0).unwrap();
        let payload = sample_payload();
        let hash = *blake3::hash(&payload).as_bytes();

        let outcome = store
            .append_turn(
                ctx.context_id,
                0,
                "demo.Turn".into(),
                1,
                0,
                0,
                payload.len() as u32,
                hash,
                &payload,
                "",
            )
            .unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.record.depth, 0);

        let forked = store.fork_context(outcome.record.turn_id).unwrap();
        assert_eq!(forked.head_turn_id, outcome.record.turn_id);
        assert_eq!(forked.head_depth, 0);
        assert_ne!(forked.context_id, ctx.context_id);

        // Dedup: the same bytes produce the same blob without growing the pack.
        let stats_before = store.stats();
        let outcome2 = store
            .append_turn(
                forked.context_id,
                0,
                "demo.Turn".into(),
                1,
                0,
                0,
                payload.len() as u32,
                hash,
                &payload,
                "",
            )
            .unwrap();
        let stats_after = store.stats();
        assert_eq!(stats_before.blobs_total, stats_after.blobs_total);
        assert_eq!(outcome2.record.payload_hash, hash);
    }

    #[test]
    fn idempotent_append_replays_prior_result() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let ctx = store.create_context(0).unwrap();
        let payload = sample_payload();
        let hash = *blake3::hash(&payload).as_bytes();

        let first = store
            .append_turn(
                ctx.context_id,
                0,
                "demo.Turn".into(),
                1,
                0,
                0,
                payload.len() as u32,
                hash,
                &payload,
                "req-1",
            )
            .unwrap();
        assert!(!first.replayed);

        let second = store
            .append_turn(
                ctx.context_id,
                0,
                "demo.Turn".into(),
                1,
                0,
                0,
                payload.len() as u32,
                hash,
                &payload,
                "req-1",
            )
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.record.turn_id, first.record.turn_id);

        let head = store.get_head(ctx.context_id).unwrap();
        assert_eq!(head.head_turn_id, first.record.turn_id);
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let ctx_id;
        let turn_id;
        {
            let store = Store::open(dir.path()).unwrap();
            let ctx = store.create_context(0).unwrap();
            let payload = sample_payload();
            let hash = *blake3::hash(&payload).as_bytes();
            let outcome = store
                .append_turn(
                    ctx.context_id,
                    0,
                    "demo.Turn".into(),
                    1,
                    0,
                    0,
                    payload.len() as u32,
                    hash,
                    &payload,
                    "",
                )
                .unwrap();
            ctx_id = ctx.context_id;
            turn_id = outcome.record.turn_id;
        }

        let store = Store::open(dir.path()).unwrap();
        let head = store.get_head(ctx_id).unwrap();
        assert_eq!(head.head_turn_id, turn_id);
        let turns = store.get_last(ctx_id, 10, true).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].payload.as_deref(), Some(sample_payload().as_slice()));
    }

    #[test]
    fn attach_fs_does_not_require_tree_to_exist() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let ctx = store.create_context(0).unwrap();
        let payload = sample_payload();
        let hash = *blake3::hash(&payload).as_bytes();
        let outcome = store
            .append_turn(
                ctx.context_id,
                0,
                "demo.Turn".into(),
                1,
                0,
                0,
                payload.len() as u32,
                hash,
                &payload,
                "",
            )
            .unwrap();

        let phantom_root = [42u8; 32];
        store.attach_fs(outcome.record.turn_id, phantom_root).unwrap();
        assert_eq!(store.get_fs_root(outcome.record.turn_id), Some(phantom_root));

        let err = store.list_fs_entries(outcome.record.turn_id, "/").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
