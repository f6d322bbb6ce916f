// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, StoreError};

const BLOB_MAGIC: u32 = 0x42534C42; // 'B''S''L''B'
const BLOB_VERSION: u16 = 1;

/// Number of hash-prefix shards serializing concurrent inserts. Keyed on the
/// first byte of the blob hash, so each shard covers 1/256th of the hash
/// space.
const SHARD_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobCodec {
    None = 0,
    Zstd = 1,
}

#[derive(Debug, Clone)]
pub struct BlobIndexEntry {
    pub offset: u64,
    pub raw_len: u32,
    pub stored_len: u32,
    pub codec: BlobCodec,
}

/// Result of `put_if_absent`: the durable index entry plus whether this call
/// is the one that actually wrote it, so callers don't need a separate,
/// unsynchronized `contains()` check racing the shard-locked insert.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub entry: BlobIndexEntry,
    pub was_new: bool,
}

pub struct BlobStore {
    pack_path: PathBuf,
    idx_path: PathBuf,
    pack_file: Mutex<File>,
    idx_file: Mutex<File>,
    index: RwLock<HashMap<[u8; 32], BlobIndexEntry>>,
    shards: Vec<Mutex<()>>,
}

impl BlobStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let pack_path = dir.join("blobs.pack");
        let idx_path = dir.join("blobs.idx");

        let mut pack_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&pack_path)?;

        let mut idx_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&idx_path)?;

        let index = recover_pack(&mut pack_file, &mut idx_file)?;

        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(()));
        }

        Ok(Self {
            pack_path,
            idx_path,
            pack_file: Mutex::new(pack_file),
            idx_file: Mutex::new(idx_file),
            index: RwLock::new(index),
            shards,
        })
    }

    fn shard_for(&self, hash: &[u8; 32]) -> &Mutex<()> {
        &self.shards[hash[0] as usize % SHARD_COUNT]
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.index.read().unwrap().contains_key(hash)
    }

    /// Insert a blob if its hash is not already present. Concurrent callers
    /// racing on the same hash are serialized by a shard lock keyed on the
    /// hash's first byte; the index is re-checked under that lock so only one
    /// of them actually writes to the pack file.
    pub fn put_if_absent(&self, hash: [u8; 32], raw_bytes: &[u8]) -> Result<PutOutcome> {
        if let Some(entry) = self.index.read().unwrap().get(&hash) {
            return Ok(PutOutcome {
                entry: entry.clone(),
                was_new: false,
            });
        }

        let shard = self.shard_for(&hash);
        let _guard = shard.lock().unwrap();

        if let Some(entry) = self.index.read().unwrap().get(&hash) {
            return Ok(PutOutcome {
                entry: entry.clone(),
                was_new: false,
            });
        }

        let mut stored_bytes = raw_bytes.to_vec();
        let mut codec = BlobCodec::None;
        if let Ok(compressed) = zstd::encode_all(raw_bytes, 1) {
            if compressed.len() < raw_bytes.len() {
                stored_bytes = compressed;
                codec = BlobCodec::Zstd;
            }
        }

        let raw_len = raw_bytes.len() as u32;
        let stored_len = stored_bytes.len() as u32;

        let mut header = Vec::with_capacity(4 + 2 + 2 + 4 + 4 + 32);
        header.write_u32::<LittleEndian>(BLOB_MAGIC)?;
        header.write_u16::<LittleEndian>(BLOB_VERSION)?;
        header.write_u16::<LittleEndian>(codec as u16)?;
        header.write_u32::<LittleEndian>(raw_len)?;
        header.write_u32::<LittleEndian>(stored_len)?;
        header.extend_from_slice(&hash);

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&stored_bytes);
        let crc = hasher.finalize();

        let offset = {
            let mut pack_file = self.pack_file.lock().unwrap();
            let offset = pack_file.seek(SeekFrom::End(0))?;
            pack_file.write_all(&header)?;
            pack_file.write_all(&stored_bytes)?;
            pack_file.write_u32::<LittleEndian>(crc)?;
            pack_file.flush()?;
            offset
        };

        let mut idx_entry = Vec::with_capacity(32 + 8 + 4 + 4 + 2 + 2);
        idx_entry.extend_from_slice(&hash);
        idx_entry.write_u64::<LittleEndian>(offset)?;
        idx_entry.write_u32::<LittleEndian>(raw_len)?;
        idx_entry.write_u32::<LittleEndian>(stored_len)?;
        idx_entry.write_u16::<LittleEndian>(codec as u16)?;
        idx_entry.write_u16::<LittleEndian>(0)?;
        {
            let mut idx_file = self.idx_file.lock().unwrap();
            idx_file.seek(SeekFrom::End(0))?;
            idx_file.write_all(&idx_entry)?;
            idx_file.flush()?;
        }

        let entry = BlobIndexEntry {
            offset,
            raw_len,
            stored_len,
            codec,
        };
        self.index.write().unwrap().insert(hash, entry.clone());
        Ok(PutOutcome {
            entry,
            was_new: true,
        })
    }

    pub fn get(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        let entry = self
            .index
            .read()
            .unwrap()
            .get(hash)
            .ok_or_else(|| StoreError::NotFound("blob".into()))?
            .clone();

        let mut pack_file = self.pack_file.lock().unwrap();
        pack_file.seek(SeekFrom::Start(entry.offset))?;

        let magic = pack_file.read_u32::<LittleEndian>()?;
        if magic != BLOB_MAGIC {
            return Err(StoreError::Corrupt("invalid blob magic".into()));
        }
        let version = pack_file.read_u16::<LittleEndian>()?;
        if version != BLOB_VERSION {
            return Err(StoreError::Corrupt("unsupported blob version".into()));
        }
        let codec_raw = pack_file.read_u16::<LittleEndian>()?;
        let raw_len = pack_file.read_u32::<LittleEndian>()?;
        let stored_len = pack_file.read_u32::<LittleEndian>()?;
        let mut stored_hash = [0u8; 32];
        pack_file.read_exact(&mut stored_hash)?;

        if &stored_hash != hash {
            return Err(StoreError::Corrupt("blob hash mismatch".into()));
        }

        let mut stored_bytes = vec![0u8; stored_len as usize];
        pack_file.read_exact(&mut stored_bytes)?;
        let crc = pack_file.read_u32::<LittleEndian>()?;
        drop(pack_file);

        let mut header = Vec::with_capacity(4 + 2 + 2 + 4 + 4 + 32);
        header.write_u32::<LittleEndian>(magic)?;
        header.write_u16::<LittleEndian>(version)?;
        header.write_u16::<LittleEndian>(codec_raw)?;
        header.write_u32::<LittleEndian>(raw_len)?;
        header.write_u32::<LittleEndian>(stored_len)?;
        header.extend_from_slice(&stored_hash);

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&stored_bytes);
        let actual_crc = hasher.finalize();
        if crc != actual_crc {
            return Err(StoreError::Corrupt("blob crc mismatch".into()));
        }

        let codec = match codec_raw {
            0 => BlobCodec::None,
            1 => BlobCodec::Zstd,
            _ => return Err(StoreError::Corrupt("unknown blob codec".into())),
        };

        let raw_bytes = match codec {
            BlobCodec::None => stored_bytes,
            BlobCodec::Zstd => zstd::decode_all(&stored_bytes[..])
                .map_err(|e| StoreError::Corrupt(format!("zstd decode failed: {e}")))?,
        };

        if raw_bytes.len() as u32 != raw_len {
            return Err(StoreError::Corrupt("blob length mismatch".into()));
        }

        Ok(raw_bytes)
    }

    pub fn stats(&self) -> BlobStoreStats {
        BlobStoreStats {
            blobs_total: self.index.read().unwrap().len(),
            pack_bytes: file_len(&self.pack_path),
            idx_bytes: file_len(&self.idx_path),
        }
    }

    /// Get the raw (uncompressed) length of a blob without loading its content.
    pub fn raw_len(&self, hash: &[u8; 32]) -> Option<u32> {
        self.index.read().unwrap().get(hash).map(|e| e.raw_len)
    }

    /// Get the stored (compressed) length of a blob without loading its content.
    pub fn stored_len(&self, hash: &[u8; 32]) -> Option<u32> {
        self.index.read().unwrap().get(hash).map(|e| e.stored_len)
    }
}

/// Each on-disk index entry is 52 bytes: hash(32) + offset(8) + raw_len(4) +
/// stored_len(4) + codec(2) + reserved(2).
const IDX_ENTRY_SIZE: usize = 32 + 8 + 4 + 4 + 2 + 2;

/// A single successfully-parsed pack record, as read by [`read_pack_record`].
struct PackRecord {
    hash: [u8; 32],
    raw_len: u32,
    stored_len: u32,
    codec_raw: u16,
}

/// Attempt to read one record at the file's current position. Returns `Ok(None)`
/// on a clean EOF (no bytes at all) or on any structural/CRC problem; in the
/// latter case the caller truncates the file back to `record_start`.
fn read_pack_record(pack_file: &mut File) -> Result<Option<PackRecord>> {
    let magic = match pack_file.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    };

    let parsed = (|| -> std::io::Result<Option<PackRecord>> {
        if magic != BLOB_MAGIC {
            return Ok(None);
        }
        let version = pack_file.read_u16::<LittleEndian>()?;
        if version != BLOB_VERSION {
            return Ok(None);
        }
        let codec_raw = pack_file.read_u16::<LittleEndian>()?;
        let raw_len = pack_file.read_u32::<LittleEndian>()?;
        let stored_len = pack_file.read_u32::<LittleEndian>()?;
        let mut hash = [0u8; 32];
        pack_file.read_exact(&mut hash)?;
        let mut stored_bytes = vec![0u8; stored_len as usize];
        pack_file.read_exact(&mut stored_bytes)?;
        let crc = pack_file.read_u32::<LittleEndian>()?;

        let mut header = Vec::with_capacity(4 + 2 + 2 + 4 + 4 + 32);
        header.write_u32::<LittleEndian>(magic)?;
        header.write_u16::<LittleEndian>(version)?;
        header.write_u16::<LittleEndian>(codec_raw)?;
        header.write_u32::<LittleEndian>(raw_len)?;
        header.write_u32::<LittleEndian>(stored_len)?;
        header.extend_from_slice(&hash);
        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&stored_bytes);
        if hasher.finalize() != crc {
            return Ok(None);
        }

        Ok(Some(PackRecord {
            hash,
            raw_len,
            stored_len,
            codec_raw,
        }))
    })();

    match parsed {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Recovery per §4.1/§4.4: scan the packfile from the start, verifying the
/// CRC of each record, and truncate it at the first incomplete or
/// CRC-invalid record. The pack is authoritative; the on-disk index file
/// (which may be stale, or missing an entry for a record that was written
/// just before a crash before its index entry was appended) is rebuilt
/// entirely from what survives the scan rather than trusted as-is.
fn recover_pack(
    pack_file: &mut File,
    idx_file: &mut File,
) -> Result<HashMap<[u8; 32], BlobIndexEntry>> {
    pack_file.seek(SeekFrom::Start(0))?;
    let mut index = HashMap::new();

    loop {
        let record_start = pack_file.stream_position()?;
        match read_pack_record(pack_file)? {
            Some(rec) => {
                let codec = match rec.codec_raw {
                    0 => BlobCodec::None,
                    1 => BlobCodec::Zstd,
                    _ => {
                        pack_file.set_len(record_start)?;
                        break;
                    }
                };
                index.insert(
                    rec.hash,
                    BlobIndexEntry {
                        offset: record_start,
                        raw_len: rec.raw_len,
                        stored_len: rec.stored_len,
                        codec,
                    },
                );
            }
            None => {
                pack_file.set_len(record_start)?;
                break;
            }
        }
    }
    pack_file.flush()?;

    // Rewrite the index file from scratch to match exactly what the pack
    // scan found; a stale or partially-written index is never trusted.
    idx_file.set_len(0)?;
    idx_file.seek(SeekFrom::Start(0))?;
    for (hash, entry) in index.iter() {
        let mut buf = Vec::with_capacity(IDX_ENTRY_SIZE);
        buf.extend_from_slice(hash);
        buf.write_u64::<LittleEndian>(entry.offset)?;
        buf.write_u32::<LittleEndian>(entry.raw_len)?;
        buf.write_u32::<LittleEndian>(entry.stored_len)?;
        buf.write_u16::<LittleEndian>(entry.codec as u16)?;
        buf.write_u16::<LittleEndian>(0)?;
        idx_file.write_all(&buf)?;
    }
    idx_file.flush()?;

    Ok(index)
}

#[derive(Debug, Clone)]
pub struct BlobStoreStats {
    pub blobs_total: usize,
    pub pack_bytes: u64,
    pub idx_bytes: u64,
}

fn file_len(path: &PathBuf) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_is_deduped_by_hash() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let hash = *blake3::hash(b"abc").as_bytes();

        let first = store.put_if_absent(hash, b"abc").unwrap();
        let before = store.stats().pack_bytes;
        let second = store.put_if_absent(hash, b"abc").unwrap();
        let after = store.stats().pack_bytes;

        assert!(first.was_new);
        assert!(!second.was_new);
        assert_eq!(first.entry.offset, second.entry.offset);
        assert_eq!(before, after, "duplicate insert must not grow the pack");
        assert_eq!(store.get(&hash).unwrap(), b"abc");
    }

    #[test]
    fn recovery_truncates_torn_trailing_record() {
        let dir = tempdir().unwrap();
        let hash_a;
        let hash_b;
        {
            let store = BlobStore::open(dir.path()).unwrap();
            hash_a = *blake3::hash(b"first blob").as_bytes();
            hash_b = *blake3::hash(b"second blob").as_bytes();
            store.put_if_absent(hash_a, b"first blob").unwrap();
            store.put_if_absent(hash_b, b"second blob").unwrap();
        }

        // Simulate a crash mid-write: truncate the pack a few bytes short of
        // its true length, slicing into the last record's CRC.
        let pack_path = dir.path().join("blobs.pack");
        let full_len = std::fs::metadata(&pack_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&pack_path).unwrap();
        file.set_len(full_len - 2).unwrap();
        drop(file);

        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.contains(&hash_a), "earlier valid blob must survive");
        assert!(
            !store.contains(&hash_b),
            "torn trailing record must not surface as present"
        );
        assert_eq!(store.get(&hash_a).unwrap(), b"first blob");

        // A fresh insert after recovery must append cleanly past the
        // truncation point, not collide with the discarded garbage.
        let hash_c = *blake3::hash(b"third blob").as_bytes();
        store.put_if_absent(hash_c, b"third blob").unwrap();
        assert_eq!(store.get(&hash_c).unwrap(), b"third blob");
    }
}
