// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Filesystem-snapshot trees attached to turns via ATTACH_FS.
//!
//! A tree is just another blob in the CAS: a msgpack-encoded array of
//! entries, each naming a child and the hash of its content (file) or of its
//! own tree blob (directory). The core never requires these blobs to be
//! present at attach time; paths under a missing tree blob simply 404 when
//! walked.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::blob_store::BlobStore;
use crate::error::{Result, StoreError};
use crate::turn_store::TurnStore;

pub const ENTRY_KIND_FILE: u8 = 0;
pub const ENTRY_KIND_DIR: u8 = 1;
pub const ENTRY_KIND_SYMLINK: u8 = 2;

/// Typed view over a [`TreeEntry`]'s raw `kind` byte, for callers (the HTTP
/// gateway) that want to match on it without re-deriving the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl From<u8> for EntryKind {
    fn from(kind: u8) -> Self {
        match kind {
            ENTRY_KIND_DIR => EntryKind::Directory,
            ENTRY_KIND_SYMLINK => EntryKind::Symlink,
            _ => EntryKind::File,
        }
    }
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "symlink",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub kind: u8,
    pub hash: Vec<u8>,
    pub size: u64,
}

impl TreeEntry {
    pub fn hash_array(&self) -> Result<[u8; 32]> {
        if self.hash.len() != 32 {
            return Err(StoreError::Corrupt("tree entry hash is not 32 bytes".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.hash);
        Ok(out)
    }
}

/// Append-only table mapping `turn_id -> fs_root_hash`.
pub struct FsRootsIndex {
    path: PathBuf,
    file: Mutex<File>,
    roots: RwLock<HashMap<u64, [u8; 32]>>,
}

impl FsRootsIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("fs.tbl");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let roots = load_roots(&mut file)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            roots: RwLock::new(roots),
        })
    }

    pub fn attach(&self, turn_id: u64, fs_root_hash: [u8; 32]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + 32 + 4);
        buf.write_u64::<LittleEndian>(turn_id)?;
        buf.extend_from_slice(&fs_root_hash);
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.write_u32::<LittleEndian>(crc)?;

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        file.flush()?;
        drop(file);

        self.roots.write().unwrap().insert(turn_id, fs_root_hash);
        Ok(())
    }

    pub fn get(&self, turn_id: u64) -> Option<[u8; 32]> {
        self.roots.read().unwrap().get(&turn_id).copied()
    }

    /// Walk up the parent chain starting at `turn_id` until a direct
    /// attachment is found. A fork inherits its parent's filesystem snapshot
    /// until it attaches its own.
    pub fn get_inherited(&self, turn_id: u64, turn_store: &TurnStore) -> Option<[u8; 32]> {
        let roots = self.roots.read().unwrap();
        let mut current = turn_id;
        loop {
            if let Some(hash) = roots.get(&current) {
                return Some(*hash);
            }
            let turn = turn_store.get_turn(current).ok()?;
            if turn.parent_turn_id == 0 {
                return None;
            }
            current = turn.parent_turn_id;
        }
    }

    pub fn unique_roots(&self) -> Vec<[u8; 32]> {
        let roots = self.roots.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for hash in roots.values() {
            if seen.insert(*hash) {
                out.push(*hash);
            }
        }
        out
    }

    pub fn stats(&self) -> FsRootsStats {
        FsRootsStats {
            entries_total: self.roots.read().unwrap().len(),
            file_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsRootsStats {
    pub entries_total: usize,
    pub file_bytes: u64,
}

fn load_roots(file: &mut File) -> Result<HashMap<u64, [u8; 32]>> {
    file.seek(SeekFrom::Start(0))?;
    let mut roots = HashMap::new();
    loop {
        let start = file.stream_position()?;
        let turn_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::Io(e)),
        };
        let mut hash = [0u8; 32];
        if file.read_exact(&mut hash).is_err() {
            file.set_len(start)?;
            break;
        }
        let crc = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };

        let mut buf = Vec::with_capacity(8 + 32);
        buf.write_u64::<LittleEndian>(turn_id)?;
        buf.extend_from_slice(&hash);
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        if hasher.finalize() != crc {
            file.set_len(start)?;
            break;
        }

        roots.insert(turn_id, hash);
    }
    Ok(roots)
}

/// Decode a tree blob (msgpack array of entries) already fetched from the CAS.
fn decode_tree_entries(raw: &[u8]) -> Result<Vec<TreeEntry>> {
    let value = rmpv::decode::read_value(&mut &raw[..])
        .map_err(|e| StoreError::Corrupt(format!("malformed tree blob: {e}")))?;

    let items = value
        .as_array()
        .ok_or_else(|| StoreError::Corrupt("tree blob is not an array".into()))?;

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let map = item
            .as_map()
            .ok_or_else(|| StoreError::Corrupt("tree entry is not a map".into()))?;

        let mut name = None;
        let mut kind = None;
        let mut hash = None;
        let mut size = 0u64;

        for (k, v) in map {
            match k.as_str() {
                Some("name") => name = v.as_str().map(|s| s.to_string()),
                Some("kind") => kind = v.as_u64().map(|n| n as u8),
                Some("hash") => hash = v.as_slice().map(|b| b.to_vec()),
                Some("size") => size = v.as_u64().unwrap_or(0),
                _ => {}
            }
        }

        entries.push(TreeEntry {
            name: name.ok_or_else(|| StoreError::Corrupt("tree entry missing name".into()))?,
            kind: kind.ok_or_else(|| StoreError::Corrupt("tree entry missing kind".into()))?,
            hash: hash.ok_or_else(|| StoreError::Corrupt("tree entry missing hash".into()))?,
            size,
        });
    }

    Ok(entries)
}

pub fn load_tree_entries(blob_store: &BlobStore, tree_hash: &[u8; 32]) -> Result<Vec<TreeEntry>> {
    let raw = blob_store.get(tree_hash)?;
    decode_tree_entries(&raw)
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|c| !c.is_empty()).collect()
}

/// Resolve `path` (relative to `root`) to the hash of the tree or file blob
/// it names, along with whether that hash is a directory.
pub fn resolve_path(
    blob_store: &BlobStore,
    root: &[u8; 32],
    path: &str,
) -> Result<([u8; 32], bool)> {
    let components = split_path(path);
    if components.is_empty() {
        return Ok((*root, true));
    }

    let mut current_hash = *root;
    for (i, comp) in components.iter().enumerate() {
        let entries = load_tree_entries(blob_store, &current_hash)?;
        let entry = entries
            .iter()
            .find(|e| e.name == *comp)
            .ok_or_else(|| StoreError::NotFound(format!("path not found: {path}")))?;
        let hash = entry.hash_array()?;

        if i == components.len() - 1 {
            return Ok((hash, entry.kind == ENTRY_KIND_DIR));
        }

        if entry.kind != ENTRY_KIND_DIR {
            return Err(StoreError::InvalidInput(format!(
                "path component is not a directory: {comp}"
            )));
        }
        current_hash = hash;
    }

    Ok((current_hash, true))
}

/// Resolve `path` to a file and return its content plus its tree entry.
pub fn get_file_at_path(
    blob_store: &BlobStore,
    root: &[u8; 32],
    path: &str,
) -> Result<(Vec<u8>, TreeEntry)> {
    let components = split_path(path);
    let (parent, file_name) = match components.split_last() {
        Some((last, rest)) => (rest, *last),
        None => return Err(StoreError::InvalidInput("path must reference a file".into())),
    };

    let mut current_hash = *root;
    for comp in parent {
        let entries = load_tree_entries(blob_store, &current_hash)?;
        let entry = entries
            .iter()
            .find(|e| e.name == *comp)
            .ok_or_else(|| StoreError::NotFound(format!("path not found: {path}")))?;
        if entry.kind != ENTRY_KIND_DIR {
            return Err(StoreError::InvalidInput(format!(
                "path component is not a directory: {comp}"
            )));
        }
        current_hash = entry.hash_array()?;
    }

    let entries = load_tree_entries(blob_store, &current_hash)?;
    let entry = entries
        .into_iter()
        .find(|e| e.name == file_name)
        .ok_or_else(|| StoreError::NotFound(format!("path not found: {path}")))?;

    if entry.kind == ENTRY_KIND_DIR {
        return Err(StoreError::InvalidInput(format!("path is a directory: {path}")));
    }

    let hash = entry.hash_array()?;
    let bytes = blob_store.get(&hash)?;
    Ok((bytes, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn attach_and_lookup_roundtrip() {
        let dir = tempdir().unwrap();
        let idx = FsRootsIndex::open(dir.path()).unwrap();
        let hash = [7u8; 32];
        idx.attach(1, hash).unwrap();
        assert_eq!(idx.get(1), Some(hash));
        assert_eq!(idx.get(2), None);
    }

    #[test]
    fn resolve_path_walks_nested_directories() {
        let dir = tempdir().unwrap();
        let blob_dir = dir.path().join("blobs");
        let blob_store = BlobStore::open(&blob_dir).unwrap();

        let file_hash = blake3::hash(b"hello world");
        blob_store
            .put_if_absent(*file_hash.as_bytes(), b"hello world")
            .unwrap();

        let child_tree = {
            let mut out = Vec::new();
            rmpv::encode::write_value(&mut out, &rmpv::Value::Array(vec![])).unwrap();
            out
        };
        let child_hash = blake3::hash(&child_tree);
        blob_store.put_if_absent(*child_hash.as_bytes(), &child_tree).unwrap();

        let root_tree = {
            let items = vec![
                rmpv::Value::Map(vec![
                    (rmpv::Value::String("name".into()), rmpv::Value::String("file.txt".into())),
                    (rmpv::Value::String("kind".into()), rmpv::Value::from(ENTRY_KIND_FILE as u64)),
                    (
                        rmpv::Value::String("hash".into()),
                        rmpv::Value::Binary(file_hash.as_bytes().to_vec()),
                    ),
                    (rmpv::Value::String("size".into()), rmpv::Value::from(11u64)),
                ]),
                rmpv::Value::Map(vec![
                    (rmpv::Value::String("name".into()), rmpv::Value::String("sub".into())),
                    (rmpv::Value::String("kind".into()), rmpv::Value::from(ENTRY_KIND_DIR as u64)),
                    (
                        rmpv::Value::String("hash".into()),
                        rmpv::Value::Binary(child_hash.as_bytes().to_vec()),
                    ),
                    (rmpv::Value::String("size".into()), rmpv::Value::from(0u64)),
                ]),
            ];
            let mut out = Vec::new();
            rmpv::encode::write_value(&mut out, &rmpv::Value::Array(items)).unwrap();
            out
        };
        let root_hash = blake3::hash(&root_tree);
        blob_store.put_if_absent(*root_hash.as_bytes(), &root_tree).unwrap();

        let (hash, is_dir) =
            resolve_path(&blob_store, root_hash.as_bytes(), "sub").unwrap();
        assert!(is_dir);
        assert_eq!(hash, *child_hash.as_bytes());

        let (bytes, entry) =
            get_file_at_path(&blob_store, root_hash.as_bytes(), "file.txt").unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(entry.kind, ENTRY_KIND_FILE);
    }

    #[test]
    fn get_inherited_walks_parent_chain_when_not_directly_attached() {
        let dir = tempdir().unwrap();
        let turn_dir = dir.path().join("turns");
        let turn_store = TurnStore::open(&turn_dir).unwrap();
        let ctx = turn_store.create_context(0).unwrap();
        let first = turn_store
            .append_turn(ctx.context_id, 0, [1u8; 32], 0, "t".into(), 1, 0, 0, "")
            .unwrap();
        let second = turn_store
            .append_turn(ctx.context_id, first.record.turn_id, [2u8; 32], 0, "t".into(), 1, 0, 0, "")
            .unwrap();

        let fs_dir = dir.path().join("fs");
        let fs_roots = FsRootsIndex::open(&fs_dir).unwrap();
        let hash = [9u8; 32];
        fs_roots.attach(first.record.turn_id, hash).unwrap();

        assert_eq!(
            fs_roots.get_inherited(second.record.turn_id, &turn_store),
            Some(hash)
        );
        assert_eq!(fs_roots.get_inherited(first.record.turn_id, &turn_store), Some(hash));
    }
}
