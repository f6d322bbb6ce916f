// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub turn_id: u64,
    pub parent_turn_id: u64,
    pub depth: u32,
    pub codec: u32,
    pub type_tag: u64,
    pub payload_hash: [u8; 32],
    pub flags: u32,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TurnMeta {
    pub declared_type_id: String,
    pub declared_type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
}

#[derive(Debug, Clone)]
pub struct ContextHead {
    pub context_id: u64,
    pub head_turn_id: u64,
    pub head_depth: u32,
    pub created_at_unix_ms: u64,
    pub flags: u32,
}

/// Outcome of appending a turn that may have been deduplicated by an
/// idempotency key.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub record: TurnRecord,
    pub replayed: bool,
}

/// Bounded table of per-context head locks, evicting the least-recently-used
/// entry once the table grows past `capacity`. An evicted lock that is still
/// held simply stays alive via the `Arc` clone its holder owns; only the
/// table's own reference is dropped.
struct ContextLockTable {
    capacity: usize,
    locks: HashMap<u64, Arc<Mutex<()>>>,
    lru: VecDeque<u64>,
}

impl ContextLockTable {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            locks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn get(&mut self, context_id: u64) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(&context_id) {
            let lock = lock.clone();
            self.touch(context_id);
            return lock;
        }

        let lock = Arc::new(Mutex::new(()));
        self.locks.insert(context_id, lock.clone());
        self.lru.push_back(context_id);
        self.evict_if_needed();
        lock
    }

    fn touch(&mut self, context_id: u64) {
        if let Some(pos) = self.lru.iter().position(|id| *id == context_id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(context_id);
    }

    fn evict_if_needed(&mut self) {
        while self.locks.len() > self.capacity {
            if let Some(victim) = self.lru.pop_front() {
                self.locks.remove(&victim);
            } else {
                break;
            }
        }
    }
}

/// In-memory shape of a loaded idempotency record.
struct IdemEntry {
    turn_id: u64,
}

pub struct TurnStore {
    turns_log_path: std::path::PathBuf,
    turns_idx_path: std::path::PathBuf,
    turns_meta_path: std::path::PathBuf,
    heads_tbl_path: std::path::PathBuf,
    turns_idem_path: std::path::PathBuf,

    turns_log: Mutex<File>,
    turns_idx: Mutex<File>,
    turns_meta: Mutex<File>,
    heads_tbl: Mutex<File>,
    turns_idem: Mutex<File>,

    turns: RwLock<HashMap<u64, TurnRecord>>,
    turn_index: RwLock<HashMap<u64, u64>>,
    turn_meta: RwLock<HashMap<u64, TurnMeta>>,
    heads: RwLock<HashMap<u64, ContextHead>>,
    idem: RwLock<HashMap<(u64, String), IdemEntry>>,

    next_turn_id: AtomicU64,
    next_context_id: AtomicU64,

    context_locks: Mutex<ContextLockTable>,
}

const DEFAULT_HEAD_LOCK_CAPACITY: usize = 4096;

impl TurnStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let turns_log_path = dir.join("turns.log");
        let turns_idx_path = dir.join("turns.idx");
        let turns_meta_path = dir.join("turns.meta");
        let heads_tbl_path = dir.join("heads.tbl");
        let turns_idem_path = dir.join("turns.idem");

        let open_rw = |path: &Path| -> Result<File> {
            Ok(OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)?)
        };

        let mut turns_log = open_rw(&turns_log_path)?;
        let mut turns_meta = open_rw(&turns_meta_path)?;
        let mut heads_tbl = open_rw(&heads_tbl_path)?;
        let mut turns_idem = open_rw(&turns_idem_path)?;
        let turns_idx = open_rw(&turns_idx_path)?;

        let mut turns = HashMap::new();
        let mut turn_index = HashMap::new();
        load_turns(&mut turns_log, &mut turns, &mut turn_index)?;

        let mut turn_meta = HashMap::new();
        load_meta(&mut turns_meta, &mut turn_meta)?;

        let mut head_history = Vec::new();
        load_heads(&mut heads_tbl, &mut head_history)?;
        let heads = reconcile_heads(&head_history, &turns);

        let mut idem = HashMap::new();
        load_idem(&mut turns_idem, &mut idem)?;

        let next_turn_id = turns.keys().max().cloned().map(|m| m + 1).unwrap_or(1);
        let next_context_id = heads.keys().max().cloned().map(|m| m + 1).unwrap_or(1);

        let store = Self {
            turns_log_path,
            turns_idx_path,
            turns_meta_path,
            heads_tbl_path,
            turns_idem_path,
            turns_log: Mutex::new(turns_log),
            turns_idx: Mutex::new(turns_idx),
            turns_meta: Mutex::new(turns_meta),
            heads_tbl: Mutex::new(heads_tbl),
            turns_idem: Mutex::new(turns_idem),
            turns: RwLock::new(turns),
            turn_index: RwLock::new(turn_index),
            turn_meta: RwLock::new(turn_meta),
            heads: RwLock::new(heads),
            idem: RwLock::new(idem),
            next_turn_id: AtomicU64::new(next_turn_id),
            next_context_id: AtomicU64::new(next_context_id),
            context_locks: Mutex::new(ContextLockTable::new(DEFAULT_HEAD_LOCK_CAPACITY)),
        };

        store.rebuild_index()?;

        Ok(store)
    }

    pub fn stats(&self) -> TurnStoreStats {
        TurnStoreStats {
            turns_total: self.turns.read().unwrap().len(),
            contexts_total: self.heads.read().unwrap().len(),
            heads_total: self.heads.read().unwrap().len(),
            turns_log_bytes: file_len(&self.turns_log_path),
            turns_index_bytes: file_len(&self.turns_idx_path),
            turns_meta_bytes: file_len(&self.turns_meta_path),
            heads_table_bytes: file_len(&self.heads_tbl_path),
        }
    }

    fn rebuild_index(&self) -> Result<()> {
        let turn_index = self.turn_index.read().unwrap();
        let mut idx_file = self.turns_idx.lock().unwrap();
        idx_file.set_len(0)?;
        idx_file.seek(SeekFrom::Start(0))?;
        for (turn_id, offset) in turn_index.iter() {
            idx_file.write_u64::<LittleEndian>(*turn_id)?;
            idx_file.write_u64::<LittleEndian>(*offset)?;
        }
        idx_file.flush()?;
        Ok(())
    }

    fn now_unix_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn head_lock(&self, context_id: u64) -> Arc<Mutex<()>> {
        self.context_locks.lock().unwrap().get(context_id)
    }

    pub fn create_context(&self, base_turn_id: u64) -> Result<ContextHead> {
        let (head_turn_id, head_depth) = if base_turn_id == 0 {
            (0, 0)
        } else {
            let turns = self.turns.read().unwrap();
            let turn = turns
                .get(&base_turn_id)
                .ok_or_else(|| StoreError::NotFound("base turn".into()))?;
            (turn.turn_id, turn.depth)
        };

        let context_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);

        let head = ContextHead {
            context_id,
            head_turn_id,
            head_depth,
            created_at_unix_ms: Self::now_unix_ms(),
            flags: 0,
        };

        // Serialize against any concurrent append/fork targeting this brand
        // new context_id (there can be none yet, but the lock keeps the
        // write-then-cache sequence consistent with the append path).
        let lock = self.head_lock(context_id);
        let _guard = lock.lock().unwrap();
        self.write_head(&head)?;
        self.heads.write().unwrap().insert(context_id, head.clone());
        Ok(head)
    }

    pub fn fork_context(&self, base_turn_id: u64) -> Result<ContextHead> {
        self.create_context(base_turn_id)
    }

    pub fn get_head(&self, context_id: u64) -> Result<ContextHead> {
        self.heads
            .read()
            .unwrap()
            .get(&context_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("context".into()))
    }

    /// Append a new turn under `context_id`, or replay a prior result if
    /// `idempotency_key` is non-empty and was already recorded for this
    /// context.
    #[allow(clippy::too_many_arguments)]
    pub fn append_turn(
        &self,
        context_id: u64,
        parent_turn_id: u64,
        payload_hash: [u8; 32],
        encoding: u32,
        declared_type_id: String,
        declared_type_version: u32,
        compression: u32,
        uncompressed_len: u32,
        idempotency_key: &str,
    ) -> Result<AppendOutcome> {
        let lock = self.head_lock(context_id);
        let _guard = lock.lock().unwrap();

        if !idempotency_key.is_empty() {
            let key = (context_id, idempotency_key.to_string());
            if let Some(entry) = self.idem.read().unwrap().get(&key) {
                let record = self
                    .turns
                    .read()
                    .unwrap()
                    .get(&entry.turn_id)
                    .cloned()
                    .ok_or_else(|| StoreError::Corrupt("idempotency record dangling".into()))?;
                return Ok(AppendOutcome {
                    record,
                    replayed: true,
                });
            }
        }

        let (parent_id, depth) = if parent_turn_id != 0 {
            let turns = self.turns.read().unwrap();
            let parent = turns
                .get(&parent_turn_id)
                .ok_or_else(|| StoreError::NotFound("parent turn".into()))?;
            (parent.turn_id, parent.depth + 1)
        } else {
            let head = self
                .heads
                .read()
                .unwrap()
                .get(&context_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound("context".into()))?;
            if head.head_turn_id == 0 {
                (0, 0)
            } else {
                let turns = self.turns.read().unwrap();
                let parent = turns
                    .get(&head.head_turn_id)
                    .ok_or_else(|| StoreError::NotFound("head turn".into()))?;
                (parent.turn_id, parent.depth + 1)
            }
        };

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);

        let record = TurnRecord {
            turn_id,
            parent_turn_id: parent_id,
            depth,
            codec: encoding,
            type_tag: 0,
            payload_hash,
            flags: 0,
            created_at_unix_ms: Self::now_unix_ms(),
        };

        let offset = {
            let mut log_file = self.turns_log.lock().unwrap();
            let offset = log_file.seek(SeekFrom::End(0))?;
            let bytes = encode_turn_record(&record)?;
            log_file.write_all(&bytes)?;
            log_file.flush()?;
            offset
        };

        {
            let mut idx_file = self.turns_idx.lock().unwrap();
            idx_file.seek(SeekFrom::End(0))?;
            idx_file.write_u64::<LittleEndian>(turn_id)?;
            idx_file.write_u64::<LittleEndian>(offset)?;
            idx_file.flush()?;
        }

        {
            let mut meta_bytes = Vec::new();
            meta_bytes.write_u64::<LittleEndian>(turn_id)?;
            meta_bytes.write_u32::<LittleEndian>(declared_type_id.len() as u32)?;
            meta_bytes.extend_from_slice(declared_type_id.as_bytes());
            meta_bytes.write_u32::<LittleEndian>(declared_type_version)?;
            meta_bytes.write_u32::<LittleEndian>(encoding)?;
            meta_bytes.write_u32::<LittleEndian>(compression)?;
            meta_bytes.write_u32::<LittleEndian>(uncompressed_len)?;
            let mut meta_file = self.turns_meta.lock().unwrap();
            meta_file.seek(SeekFrom::End(0))?;
            meta_file.write_all(&meta_bytes)?;
            meta_file.flush()?;
        }

        self.turn_meta.write().unwrap().insert(
            turn_id,
            TurnMeta {
                declared_type_id,
                declared_type_version,
                encoding,
                compression,
                uncompressed_len,
            },
        );
        self.turns.write().unwrap().insert(turn_id, record.clone());
        self.turn_index.write().unwrap().insert(turn_id, offset);

        let head = ContextHead {
            context_id,
            head_turn_id: turn_id,
            head_depth: depth,
            created_at_unix_ms: record.created_at_unix_ms,
            flags: 0,
        };
        self.write_head(&head)?;
        self.heads.write().unwrap().insert(context_id, head);

        if !idempotency_key.is_empty() {
            self.write_idem(context_id, idempotency_key, turn_id)?;
            self.idem.write().unwrap().insert(
                (context_id, idempotency_key.to_string()),
                IdemEntry { turn_id },
            );
        }

        Ok(AppendOutcome {
            record,
            replayed: false,
        })
    }

    fn write_head(&self, head: &ContextHead) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + 4 + 8 + 4);
        buf.write_u64::<LittleEndian>(head.context_id)?;
        buf.write_u64::<LittleEndian>(head.head_turn_id)?;
        buf.write_u32::<LittleEndian>(head.head_depth)?;
        buf.write_u32::<LittleEndian>(head.flags)?;
        buf.write_u64::<LittleEndian>(head.created_at_unix_ms)?;
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.write_u32::<LittleEndian>(crc)?;
        let mut heads_file = self.heads_tbl.lock().unwrap();
        heads_file.seek(SeekFrom::End(0))?;
        heads_file.write_all(&buf)?;
        heads_file.flush()?;
        Ok(())
    }

    fn write_idem(&self, context_id: u64, key: &str, turn_id: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + 4 + key.len() + 8 + 4);
        buf.write_u64::<LittleEndian>(context_id)?;
        buf.write_u32::<LittleEndian>(key.len() as u32)?;
        buf.extend_from_slice(key.as_bytes());
        buf.write_u64::<LittleEndian>(turn_id)?;
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.write_u32::<LittleEndian>(crc)?;
        let mut idem_file = self.turns_idem.lock().unwrap();
        idem_file.seek(SeekFrom::End(0))?;
        idem_file.write_all(&buf)?;
        idem_file.flush()?;
        Ok(())
    }

    pub fn get_turn(&self, turn_id: u64) -> Result<TurnRecord> {
        self.turns
            .read()
            .unwrap()
            .get(&turn_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("turn".into()))
    }

    pub fn get_turn_meta(&self, turn_id: u64) -> Result<TurnMeta> {
        self.turn_meta
            .read()
            .unwrap()
            .get(&turn_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("turn meta".into()))
    }

    pub fn get_last(&self, context_id: u64, limit: u32) -> Result<Vec<TurnRecord>> {
        let head = self
            .heads
            .read()
            .unwrap()
            .get(&context_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("context".into()))?;

        let turns = self.turns.read().unwrap();
        let mut results = Vec::new();
        let mut current = head.head_turn_id;
        while current != 0 && results.len() < limit as usize {
            let rec = turns
                .get(&current)
                .ok_or_else(|| StoreError::NotFound("turn".into()))?
                .clone();
            current = rec.parent_turn_id;
            results.push(rec);
        }
        results.reverse();
        Ok(results)
    }

    pub fn get_before(
        &self,
        context_id: u64,
        before_turn_id: u64,
        limit: u32,
    ) -> Result<Vec<TurnRecord>> {
        let head = self
            .heads
            .read()
            .unwrap()
            .get(&context_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("context".into()))?;

        if before_turn_id == 0 || head.head_turn_id == 0 {
            return self.get_last(context_id, limit);
        }

        let turns = self.turns.read().unwrap();
        let before = turns
            .get(&before_turn_id)
            .ok_or_else(|| StoreError::NotFound("before turn".into()))?;
        let mut current = before.parent_turn_id;
        let mut results = Vec::new();
        while current != 0 && results.len() < limit as usize {
            let rec = turns
                .get(&current)
                .ok_or_else(|| StoreError::NotFound("turn".into()))?
                .clone();
            current = rec.parent_turn_id;
            results.push(rec);
        }
        results.reverse();
        Ok(results)
    }

    /// Get the first turn (depth=0) of a context, if it exists.
    pub fn get_first_turn(&self, context_id: u64) -> Result<TurnRecord> {
        let head = self
            .heads
            .read()
            .unwrap()
            .get(&context_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("context".into()))?;

        let turns = self.turns.read().unwrap();
        let mut current = head.head_turn_id;
        while current != 0 {
            let rec = turns
                .get(&current)
                .ok_or_else(|| StoreError::NotFound("turn".into()))?;
            if rec.depth == 0 {
                return Ok(rec.clone());
            }
            current = rec.parent_turn_id;
        }

        Err(StoreError::NotFound("first turn".into()))
    }

    pub fn list_recent_contexts(&self, limit: u32) -> Vec<ContextHead> {
        let mut contexts: Vec<ContextHead> = self.heads.read().unwrap().values().cloned().collect();
        contexts.sort_by(|a, b| b.created_at_unix_ms.cmp(&a.created_at_unix_ms));
        contexts.truncate(limit as usize);
        contexts
    }
}

#[derive(Debug, Clone)]
pub struct TurnStoreStats {
    pub turns_total: usize,
    pub contexts_total: usize,
    pub heads_total: usize,
    pub turns_log_bytes: u64,
    pub turns_index_bytes: u64,
    pub turns_meta_bytes: u64,
    pub heads_table_bytes: u64,
}

fn file_len(path: &std::path::PathBuf) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn load_turns(
    file: &mut File,
    turns: &mut HashMap<u64, TurnRecord>,
    turn_index: &mut HashMap<u64, u64>,
) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut offset = 0u64;
    loop {
        let start = file.stream_position()?;
        let record = match read_turn_record(file) {
            Ok(rec) => rec,
            Err(StoreError::Corrupt(_)) => {
                file.set_len(start)?;
                break;
            }
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                file.set_len(start)?;
                break;
            }
            Err(e) => return Err(e),
        };

        turns.insert(record.turn_id, record.clone());
        turn_index.insert(record.turn_id, offset);
        offset = file.stream_position()?;
    }
    Ok(())
}

fn load_meta(file: &mut File, turn_meta: &mut HashMap<u64, TurnMeta>) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    loop {
        let start = file.stream_position()?;
        let turn_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::Io(e)),
        };
        let len = match file.read_u32::<LittleEndian>() {
            Ok(v) => v as usize,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let mut buf = vec![0u8; len];
        if file.read_exact(&mut buf).is_err() {
            file.set_len(start)?;
            break;
        }
        let declared_type_id = match String::from_utf8(buf) {
            Ok(s) => s,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let declared_type_version = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let encoding = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let compression = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let uncompressed_len = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };

        turn_meta.insert(
            turn_id,
            TurnMeta {
                declared_type_id,
                declared_type_version,
                encoding,
                compression,
                uncompressed_len,
            },
        );
    }

    Ok(())
}

/// Load every valid `ContextHeadRecord` from `heads.tbl` in file order (the
/// table is append-only; later records for a given `context_id` supersede
/// earlier ones). Returning the full history, rather than collapsing to one
/// record per context, lets `open()` demote a head that turns out to
/// reference a turn truncated away by `load_turns`'s own recovery pass to
/// the most recent surviving record for that context, per §4.4.
fn load_heads(file: &mut File, history: &mut Vec<ContextHead>) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    loop {
        let start = file.stream_position()?;
        let context_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::Io(e)),
        };
        let head_turn_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let head_depth = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let flags = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let created_at_unix_ms = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let crc = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };

        let mut buf = Vec::with_capacity(8 + 8 + 4 + 4 + 8);
        buf.write_u64::<LittleEndian>(context_id)?;
        buf.write_u64::<LittleEndian>(head_turn_id)?;
        buf.write_u32::<LittleEndian>(head_depth)?;
        buf.write_u32::<LittleEndian>(flags)?;
        buf.write_u64::<LittleEndian>(created_at_unix_ms)?;
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let actual_crc = hasher.finalize();
        if crc != actual_crc {
            file.set_len(start)?;
            break;
        }

        history.push(ContextHead {
            context_id,
            head_turn_id,
            head_depth,
            created_at_unix_ms,
            flags,
        });
    }
    Ok(())
}

/// Collapse a chronological head-record history to one entry per
/// `context_id` (last write wins), then demote any head whose `head_turn_id`
/// did not survive `load_turns`'s truncation to the most recent record for
/// that context that *did* survive (walking backward through the history),
/// falling back to an empty head (`head_turn_id=0`) if none did.
fn reconcile_heads(
    history: &[ContextHead],
    turns: &HashMap<u64, TurnRecord>,
) -> HashMap<u64, ContextHead> {
    let mut heads: HashMap<u64, ContextHead> = HashMap::new();
    for head in history {
        heads.insert(head.context_id, head.clone());
    }

    for head in heads.values_mut() {
        if head.head_turn_id != 0 && !turns.contains_key(&head.head_turn_id) {
            let replacement = history
                .iter()
                .rev()
                .find(|h| {
                    h.context_id == head.context_id
                        && (h.head_turn_id == 0 || turns.contains_key(&h.head_turn_id))
                })
                .cloned();
            match replacement {
                Some(r) => *head = r,
                None => {
                    head.head_turn_id = 0;
                    head.head_depth = 0;
                }
            }
        }
    }

    heads
}

fn load_idem(file: &mut File, idem: &mut HashMap<(u64, String), IdemEntry>) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    loop {
        let start = file.stream_position()?;
        let context_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::Io(e)),
        };
        let key_len = match file.read_u32::<LittleEndian>() {
            Ok(v) => v as usize,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let mut key_buf = vec![0u8; key_len];
        if file.read_exact(&mut key_buf).is_err() {
            file.set_len(start)?;
            break;
        }
        let key = match String::from_utf8(key_buf) {
            Ok(s) => s,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let turn_id = match file.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };
        let crc = match file.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => {
                file.set_len(start)?;
                break;
            }
        };

        let mut buf = Vec::with_capacity(8 + 4 + key.len() + 8);
        buf.write_u64::<LittleEndian>(context_id)?;
        buf.write_u32::<LittleEndian>(key.len() as u32)?;
        buf.extend_from_slice(key.as_bytes());
        buf.write_u64::<LittleEndian>(turn_id)?;
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let actual_crc = hasher.finalize();
        if crc != actual_crc {
            file.set_len(start)?;
            break;
        }

        idem.insert((context_id, key), IdemEntry { turn_id });
    }
    Ok(())
}

fn encode_turn_record(record: &TurnRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(80);
    buf.write_u64::<LittleEndian>(record.turn_id)?;
    buf.write_u64::<LittleEndian>(record.parent_turn_id)?;
    buf.write_u32::<LittleEndian>(record.depth)?;
    buf.write_u32::<LittleEndian>(record.codec)?;
    buf.write_u64::<LittleEndian>(record.type_tag)?;
    buf.extend_from_slice(&record.payload_hash);
    buf.write_u32::<LittleEndian>(record.flags)?;
    buf.write_u64::<LittleEndian>(record.created_at_unix_ms)?;
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_hash(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    #[test]
    fn recovery_truncates_torn_trailing_turn_and_resumes_allocation() {
        let dir = tempdir().unwrap();
        let ctx_id;
        let turn1_id;
        let turn2_id;
        {
            let store = TurnStore::open(dir.path()).unwrap();
            let ctx = store.create_context(0).unwrap();
            ctx_id = ctx.context_id;
            let first = store
                .append_turn(
                    ctx_id,
                    0,
                    sample_hash(1),
                    0,
                    "demo.Turn".into(),
                    1,
                    0,
                    0,
                    "",
                )
                .unwrap();
            turn1_id = first.record.turn_id;
            let second = store
                .append_turn(
                    ctx_id,
                    0,
                    sample_hash(2),
                    0,
                    "demo.Turn".into(),
                    1,
                    0,
                    0,
                    "",
                )
                .unwrap();
            turn2_id = second.record.turn_id;
        }

        // Simulate a crash mid-write of the second turn's log record: lop a
        // few bytes off the end of turns.log, landing inside the CRC of the
        // last record.
        let log_path = dir.path().join("turns.log");
        let full_len = std::fs::metadata(&log_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(full_len - 3).unwrap();
        drop(file);

        let store = TurnStore::open(dir.path()).unwrap();
        assert!(store.get_turn(turn1_id).is_ok(), "first turn must survive");
        assert!(
            store.get_turn(turn2_id).is_err(),
            "torn trailing turn must not survive recovery"
        );

        // The head for the context was advanced by the torn write, but the
        // heads table append for it never reached durable storage either
        // (it happens strictly after the turn log write), so the head
        // should still point at the surviving first turn.
        let head = store.get_head(ctx_id).unwrap();
        assert_eq!(head.head_turn_id, turn1_id);

        // The monotonic allocator must not reuse the discarded turn's id.
        let resumed = store
            .append_turn(ctx_id, 0, sample_hash(3), 0, "demo.Turn".into(), 1, 0, 0, "")
            .unwrap();
        assert_eq!(resumed.record.turn_id, turn2_id);
        assert_eq!(resumed.record.parent_turn_id, turn1_id);
    }
}

fn read_turn_record(reader: &mut File) -> Result<TurnRecord> {
    let turn_id = reader.read_u64::<LittleEndian>()?;
    let parent_turn_id = reader.read_u64::<LittleEndian>()?;
    let depth = reader.read_u32::<LittleEndian>()?;
    let codec = reader.read_u32::<LittleEndian>()?;
    let type_tag = reader.read_u64::<LittleEndian>()?;
    let mut payload_hash = [0u8; 32];
    reader.read_exact(&mut payload_hash)?;
    let flags = reader.read_u32::<LittleEndian>()?;
    let created_at_unix_ms = reader.read_u64::<LittleEndian>()?;
    let crc = reader.read_u32::<LittleEndian>()?;

    let mut buf = Vec::with_capacity(80);
    buf.write_u64::<LittleEndian>(turn_id)?;
    buf.write_u64::<LittleEndian>(parent_turn_id)?;
    buf.write_u32::<LittleEndian>(depth)?;
    buf.write_u32::<LittleEndian>(codec)?;
    buf.write_u64::<LittleEndian>(type_tag)?;
    buf.extend_from_slice(&payload_hash);
    buf.write_u32::<LittleEndian>(flags)?;
    buf.write_u64::<LittleEndian>(created_at_unix_ms)?;
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let actual_crc = hasher.finalize();

    if crc != actual_crc {
        return Err(StoreError::Corrupt("turn crc mismatch".into()));
    }

    Ok(TurnRecord {
        turn_id,
        parent_turn_id,
        depth,
        codec,
        type_tag,
        payload_hash,
        flags,
        created_at_unix_ms,
    })
}
