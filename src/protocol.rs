// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Binary frame codec and per-message payload encode/decode.
//!
//! Frame: `len:u32 | msg_type:u16 | flags:u16 | req_id:u64 | payload[len]`,
//! little-endian throughout. One persistent TCP connection per client;
//! responses are matched to requests by `req_id`.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Hello = 1,
    CtxCreate = 2,
    CtxFork = 3,
    GetHead = 4,
    AppendTurn = 5,
    GetLast = 6,
    GetBlob = 9,
    AttachFs = 10,
    PutBlob = 11,
    Error = 255,
}

/// Bit 0 of APPEND_TURN's flags: an `fs_root_hash` follows the idempotency key.
pub const FLAG_HAS_FS_ROOT: u16 = 0x0001;

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub req_id: u64,
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)> {
    read_frame_limited(reader, u32::MAX)
}

/// Like [`read_frame`], but rejects a declared payload length over
/// `max_payload_bytes` before allocating a buffer for it. A client lying
/// about `len` in the frame header cannot be used to force an arbitrarily
/// large allocation.
pub fn read_frame_limited<R: Read>(
    reader: &mut R,
    max_payload_bytes: u32,
) -> Result<(FrameHeader, Vec<u8>)> {
    let len = reader.read_u32::<LittleEndian>()?;
    let msg_type = reader.read_u16::<LittleEndian>()?;
    let flags = reader.read_u16::<LittleEndian>()?;
    let req_id = reader.read_u64::<LittleEndian>()?;
    if len > max_payload_bytes {
        let mut discard = vec![0u8; len.min(max_payload_bytes) as usize];
        let _ = reader.read_exact(&mut discard);
        return Err(StoreError::InvalidInput(format!(
            "frame payload of {len} bytes exceeds max of {max_payload_bytes}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok((
        FrameHeader {
            len,
            msg_type,
            flags,
            req_id,
        },
        payload,
    ))
}

pub fn write_frame<W: std::io::Write>(
    writer: &mut W,
    msg_type: u16,
    flags: u16,
    req_id: u64,
    payload: &[u8],
) -> Result<()> {
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_u16::<LittleEndian>(msg_type)?;
    writer.write_u16::<LittleEndian>(flags)?;
    writer.write_u64::<LittleEndian>(req_id)?;
    writer.write_all(payload)?;
    Ok(())
}

fn read_string(cursor: &mut std::io::Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| StoreError::InvalidInput("invalid utf8 string".into()))
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    buf.write_u32::<LittleEndian>(s.len() as u32)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_bytes32(cursor: &mut std::io::Cursor<&[u8]>) -> Result<[u8; 32]> {
    let mut buf = [0u8; 32];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_blob(cursor: &mut std::io::Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_blob(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    buf.write_u32::<LittleEndian>(data.len() as u32)?;
    buf.extend_from_slice(data);
    Ok(())
}

// ---------------------------------------------------------------------
// HELLO

pub struct HelloReq {
    pub protocol_version: u16,
    pub client_tag: String,
}

pub fn parse_hello(payload: &[u8]) -> Result<HelloReq> {
    let mut cursor = std::io::Cursor::new(payload);
    let protocol_version = cursor.read_u16::<LittleEndian>()?;
    let client_tag = read_string(&mut cursor)?;
    Ok(HelloReq {
        protocol_version,
        client_tag,
    })
}

pub fn encode_hello_resp(session_id: u64, protocol_version: u16) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(10);
    buf.write_u64::<LittleEndian>(session_id)?;
    buf.write_u16::<LittleEndian>(protocol_version)?;
    Ok(buf)
}

// ---------------------------------------------------------------------
// CTX_CREATE / CTX_FORK / GET_HEAD

pub fn parse_ctx_create(payload: &[u8]) -> Result<u64> {
    let mut cursor = std::io::Cursor::new(payload);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

pub fn parse_ctx_fork(payload: &[u8]) -> Result<u64> {
    let mut cursor = std::io::Cursor::new(payload);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

pub fn parse_get_head(payload: &[u8]) -> Result<u64> {
    let mut cursor = std::io::Cursor::new(payload);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

pub fn encode_ctx_create_resp(context_id: u64, head_turn_id: u64, head_depth: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(20);
    buf.write_u64::<LittleEndian>(context_id)?;
    buf.write_u64::<LittleEndian>(head_turn_id)?;
    buf.write_u32::<LittleEndian>(head_depth)?;
    Ok(buf)
}

// ---------------------------------------------------------------------
// APPEND_TURN

pub struct AppendTurnReq {
    pub context_id: u64,
    pub parent_turn_id: u64,
    pub declared_type_id: String,
    pub declared_type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
    pub content_hash: [u8; 32],
    pub payload_bytes: Vec<u8>,
    pub idempotency_key: String,
    pub fs_root_hash: Option<[u8; 32]>,
}

pub fn parse_append_turn(payload: &[u8], flags: u16) -> Result<AppendTurnReq> {
    let mut cursor = std::io::Cursor::new(payload);
    let context_id = cursor.read_u64::<LittleEndian>()?;
    let parent_turn_id = cursor.read_u64::<LittleEndian>()?;
    let declared_type_id = read_string(&mut cursor)?;
    let declared_type_version = cursor.read_u32::<LittleEndian>()?;
    let encoding = cursor.read_u32::<LittleEndian>()?;
    let compression = cursor.read_u32::<LittleEndian>()?;
    let uncompressed_len = cursor.read_u32::<LittleEndian>()?;
    let content_hash = read_bytes32(&mut cursor)?;
    let payload_bytes = read_blob(&mut cursor)?;
    let idempotency_key = read_string(&mut cursor)?;
    let fs_root_hash = if flags & FLAG_HAS_FS_ROOT != 0 {
        Some(read_bytes32(&mut cursor)?)
    } else {
        None
    };

    Ok(AppendTurnReq {
        context_id,
        parent_turn_id,
        declared_type_id,
        declared_type_version,
        encoding,
        compression,
        uncompressed_len,
        content_hash,
        payload_bytes,
        idempotency_key,
        fs_root_hash,
    })
}

pub fn encode_append_ack(
    context_id: u64,
    turn_id: u64,
    depth: u32,
    payload_hash: &[u8; 32],
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + 8 + 4 + 32);
    buf.write_u64::<LittleEndian>(context_id)?;
    buf.write_u64::<LittleEndian>(turn_id)?;
    buf.write_u32::<LittleEndian>(depth)?;
    buf.extend_from_slice(payload_hash);
    Ok(buf)
}

// ---------------------------------------------------------------------
// GET_LAST

pub struct GetLastReq {
    pub context_id: u64,
    pub limit: u32,
    pub include_payload: u8,
}

pub fn parse_get_last(payload: &[u8]) -> Result<GetLastReq> {
    let mut cursor = std::io::Cursor::new(payload);
    let context_id = cursor.read_u64::<LittleEndian>()?;
    let limit = cursor.read_u32::<LittleEndian>()?;
    let include_payload = cursor.read_u8()?;
    Ok(GetLastReq {
        context_id,
        limit,
        include_payload,
    })
}

// ---------------------------------------------------------------------
// GET_BLOB / PUT_BLOB

pub fn parse_get_blob(payload: &[u8]) -> Result<[u8; 32]> {
    let mut cursor = std::io::Cursor::new(payload);
    read_bytes32(&mut cursor)
}

pub struct PutBlobReq {
    pub hash: [u8; 32],
    pub data: Vec<u8>,
}

pub fn parse_put_blob(payload: &[u8]) -> Result<PutBlobReq> {
    let mut cursor = std::io::Cursor::new(payload);
    let hash = read_bytes32(&mut cursor)?;
    let data = read_blob(&mut cursor)?;
    Ok(PutBlobReq { hash, data })
}

pub fn encode_put_blob_resp(hash: &[u8; 32], was_new: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(33);
    buf.extend_from_slice(hash);
    buf.write_u8(was_new as u8)?;
    Ok(buf)
}

// ---------------------------------------------------------------------
// ATTACH_FS

pub struct AttachFsReq {
    pub turn_id: u64,
    pub fs_root_hash: [u8; 32],
}

pub fn parse_attach_fs(payload: &[u8]) -> Result<AttachFsReq> {
    let mut cursor = std::io::Cursor::new(payload);
    let turn_id = cursor.read_u64::<LittleEndian>()?;
    let fs_root_hash = read_bytes32(&mut cursor)?;
    Ok(AttachFsReq {
        turn_id,
        fs_root_hash,
    })
}

pub fn encode_attach_fs_resp(turn_id: u64, fs_root_hash: &[u8; 32]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(40);
    buf.write_u64::<LittleEndian>(turn_id)?;
    buf.extend_from_slice(fs_root_hash);
    Ok(buf)
}

// ---------------------------------------------------------------------
// ERROR

pub fn encode_error(code: u16, detail: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + detail.len() + 4);
    buf.write_u16::<LittleEndian>(code)?;
    write_string(&mut buf, detail)?;
    Ok(buf)
}

pub fn decode_error(payload: &[u8]) -> Result<(u16, String)> {
    let mut cursor = std::io::Cursor::new(payload);
    let code = cursor.read_u16::<LittleEndian>()?;
    let detail = read_string(&mut cursor)?;
    Ok((code, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, MsgType::Hello as u16, FLAG_HAS_FS_ROOT, 42, b"payload").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (header, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(header.msg_type, MsgType::Hello as u16);
        assert_eq!(header.flags, FLAG_HAS_FS_ROOT);
        assert_eq!(header.req_id, 42);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn append_turn_round_trips_without_fs_root() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(1).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        write_string(&mut buf, "cxdb.ConversationItem").unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(5).unwrap();
        buf.extend_from_slice(&[7u8; 32]);
        write_blob(&mut buf, b"hello").unwrap();
        write_string(&mut buf, "idem-1").unwrap();

        let req = parse_append_turn(&buf, 0).unwrap();
        assert_eq!(req.context_id, 1);
        assert_eq!(req.declared_type_id, "cxdb.ConversationItem");
        assert_eq!(req.payload_bytes, b"hello");
        assert_eq!(req.idempotency_key, "idem-1");
        assert!(req.fs_root_hash.is_none());
    }

    #[test]
    fn append_turn_reads_fs_root_when_flagged() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(1).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        write_string(&mut buf, "t").unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.extend_from_slice(&[0u8; 32]);
        write_blob(&mut buf, b"x").unwrap();
        write_string(&mut buf, "").unwrap();
        buf.extend_from_slice(&[9u8; 32]);

        let req = parse_append_turn(&buf, FLAG_HAS_FS_ROOT).unwrap();
        assert_eq!(req.fs_root_hash, Some([9u8; 32]));
    }

    #[test]
    fn error_round_trips() {
        let buf = encode_error(422, "bad input").unwrap();
        let (code, detail) = decode_error(&buf).unwrap();
        assert_eq!(code, 422);
        assert_eq!(detail, "bad input");
    }
}
