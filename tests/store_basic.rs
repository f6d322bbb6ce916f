// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use blake3::Hasher;
use cxdb_server::store::Store;
use tempfile::tempdir;

#[test]
fn append_and_fork() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");

    let ctx = store.create_context(0).expect("create context");
    assert_eq!(ctx.head_turn_id, 0);

    let payload = b"hello world".to_vec();
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let hash = hasher.finalize();

    let first = store
        .append_turn(
            ctx.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            payload.len() as u32,
            *hash.as_bytes(),
            &payload,
            "",
        )
        .expect("append first")
        .record;

    let fork = store.fork_context(first.turn_id).expect("fork context");

    let second_payload = b"a different payload".to_vec();
    let mut hasher2 = Hasher::new();
    hasher2.update(&second_payload);
    let hash2 = hasher2.finalize();

    let _second = store
        .append_turn(
            fork.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            second_payload.len() as u32,
            *hash2.as_bytes(),
            &second_payload,
            "",
        )
        .expect("append second");

    assert!(store.blob_store.contains(hash.as_bytes()));

    let last = store.get_last(fork.context_id, 10, true).expect("get last");
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].record.turn_id, _second.record.turn_id);
}

#[test]
fn append_turn_is_idempotent_on_repeated_key() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");

    let ctx = store.create_context(0).expect("create context");
    let payload = b"idempotent payload".to_vec();
    let hash = blake3::hash(&payload);

    let first = store
        .append_turn(
            ctx.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            payload.len() as u32,
            *hash.as_bytes(),
            &payload,
            "req-1",
        )
        .expect("append first");
    assert!(!first.replayed);

    let replay = store
        .append_turn(
            ctx.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            payload.len() as u32,
            *hash.as_bytes(),
            &payload,
            "req-1",
        )
        .expect("replay append");
    assert!(replay.replayed);
    assert_eq!(replay.record.turn_id, first.record.turn_id);

    let last = store.get_last(ctx.context_id, 10, false).expect("get last");
    assert_eq!(last.len(), 1, "idempotent replay must not create a second turn");
}

#[test]
fn rejects_payload_with_mismatched_hash() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");
    let ctx = store.create_context(0).expect("create context");

    let payload = b"real payload".to_vec();
    let wrong_hash = blake3::hash(b"a different payload entirely");

    let err = store
        .append_turn(
            ctx.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            payload.len() as u32,
            *wrong_hash.as_bytes(),
            &payload,
            "",
        )
        .expect_err("hash mismatch must be rejected");
    assert_eq!(err.code().0, 422);
}

#[test]
fn data_persists_across_reopen() {
    let dir = tempdir().expect("tempdir");

    let payload = b"persist me".to_vec();
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let hash = hasher.finalize();

    let (context_id, turn_id) = {
        let store = Store::open(dir.path()).expect("open store");
        let ctx = store.create_context(0).expect("create context");
        let turn = store
            .append_turn(
                ctx.context_id,
                0,
                "com.example.Persist".to_string(),
                1,
                1,
                0,
                payload.len() as u32,
                *hash.as_bytes(),
                &payload,
                "",
            )
            .expect("append turn")
            .record;
        (ctx.context_id, turn.turn_id)
    }; // store dropped, files closed

    // Reopen the same directory, data should still be there.
    let store = Store::open(dir.path()).expect("reopen store");
    let contexts = store.list_recent_contexts(100);
    assert!(
        !contexts.is_empty(),
        "expected at least one context after reopen"
    );
    let last = store
        .get_last(context_id, 10, true)
        .expect("get last after reopen");
    assert_eq!(last.len(), 1, "expected one turn after reopen");
    assert_eq!(last[0].record.turn_id, turn_id);
    assert!(
        store.blob_store.contains(hash.as_bytes()),
        "blob should persist after reopen"
    );
}

#[test]
fn attach_fs_and_inherit_across_fork() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");

    let ctx = store.create_context(0).expect("create context");
    let payload = b"turn with fs".to_vec();
    let hash = blake3::hash(&payload);
    let first = store
        .append_turn(
            ctx.context_id,
            0,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            payload.len() as u32,
            *hash.as_bytes(),
            &payload,
            "",
        )
        .expect("append")
        .record;

    let fs_root = [7u8; 32];
    store.attach_fs(first.turn_id, fs_root).expect("attach fs");
    assert_eq!(store.get_fs_root_direct(first.turn_id), Some(fs_root));

    let fork = store.fork_context(first.turn_id).expect("fork");
    let fork_payload = b"fork turn".to_vec();
    let fork_hash = blake3::hash(&fork_payload);
    let fork_turn = store
        .append_turn(
            fork.context_id,
            first.turn_id,
            "com.example.Test".to_string(),
            1,
            1,
            0,
            fork_payload.len() as u32,
            *fork_hash.as_bytes(),
            &fork_payload,
            "",
        )
        .expect("append on fork")
        .record;

    assert_eq!(store.get_fs_root_direct(fork_turn.turn_id), None);
    assert_eq!(
        store.get_fs_root(fork_turn.turn_id),
        Some(fs_root),
        "fork's descendant turn should inherit the parent's fs root"
    );
}
