// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::WriteBytesExt;
use tracing::{error, info, warn};

use cxdb_server::config::Config;
use cxdb_server::error::{Result, StoreError};
use cxdb_server::events::{EventBus, StoreEvent};
use cxdb_server::http::start_http;
use cxdb_server::metrics::Metrics;
use cxdb_server::metrics::SessionTracker;
use cxdb_server::protocol::{
    encode_append_ack, encode_attach_fs_resp, encode_ctx_create_resp, encode_error,
    encode_hello_resp, encode_put_blob_resp, parse_append_turn, parse_attach_fs, parse_ctx_create,
    parse_ctx_fork, parse_get_blob, parse_get_head, parse_get_last, parse_hello, parse_put_blob,
    read_frame_limited, write_frame, MsgType,
};
use cxdb_server::registry::Registry;
use cxdb_server::store::Store;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(Store::open(&config.data_dir)?);
    let registry = Arc::new(Mutex::new(Registry::open(
        &config.data_dir.join("registry"),
    )?));
    let metrics = Arc::new(Metrics::new(config.data_dir.clone()));
    let session_tracker = Arc::new(SessionTracker::new());
    let event_bus = Arc::new(EventBus::new());

    spawn_event_logger(&event_bus);

    let _http = start_http(
        config.http_bind_addr.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        Arc::clone(&session_tracker),
        Arc::clone(&event_bus),
    )?;
    info!(addr = %config.http_bind_addr, "http gateway listening");

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .expect("Error setting signal handler");

    let listener = TcpListener::bind(&config.bind_addr)?;
    listener
        .set_nonblocking(true)
        .expect("Cannot set non-blocking");
    info!(addr = %config.bind_addr, "cxdb listening");

    // Accept loop with shutdown check
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                // Set blocking mode for client handling (listener is non-blocking for shutdown checks)
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(error = %e, "failed to set blocking mode");
                    continue;
                }
                let store = Arc::clone(&store);
                let registry = Arc::clone(&registry);
                let metrics = Arc::clone(&metrics);
                let session_tracker = Arc::clone(&session_tracker);
                let event_bus = Arc::clone(&event_bus);
                let max_payload_bytes = config.max_payload_bytes;
                let strict_registry = config.strict_registry;
                let peer_addr_str = peer_addr.to_string();
                thread::spawn(move || {
                    if let Err(err) = handle_client(
                        stream,
                        store,
                        registry,
                        metrics,
                        session_tracker,
                        event_bus,
                        peer_addr_str,
                        max_payload_bytes,
                        strict_registry,
                    ) {
                        warn!(error = %err, "connection error");
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // No incoming connection, sleep briefly and check shutdown
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }

    info!("shutting down");
    Ok(())
}

/// Subscribe to the event bus and log every event via `tracing`. This is the
/// server's own consumer of the events the protocol and HTTP handlers
/// publish; external consumers would otherwise have no durable record of
/// them since the bus itself is in-memory and fire-and-forget.
fn spawn_event_logger(event_bus: &Arc<EventBus>) {
    let subscriber = event_bus.subscribe();
    thread::spawn(move || {
        while let Some(event) = subscriber.recv() {
            let (event_type, data) = event.to_sse();
            info!(event = event_type, data = %data, "store event");
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_client(
    mut stream: TcpStream,
    store: Arc<Store>,
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<Metrics>,
    session_tracker: Arc<SessionTracker>,
    event_bus: Arc<EventBus>,
    peer_addr: String,
    max_payload_bytes: u32,
    strict_registry: bool,
) -> Result<()> {
    let session = metrics.register_session();
    let session_id = session.session_id();
    // Client tag will be set when HELLO is received
    let mut client_tag_received = false;
    let mut client_tag = String::new();

    loop {
        let (header, payload) = match read_frame_limited(&mut stream, max_payload_bytes) {
            Ok(v) => v,
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err @ StoreError::InvalidInput(_)) => {
                // Oversized frame: the stream position can no longer be
                // trusted to be frame-aligned, so close the connection after
                // reporting the error rather than looping on garbage.
                let payload = encode_error(err.code().0, &err.detail())?;
                write_frame(&mut stream, MsgType::Error as u16, 0, 0, &payload)?;
                stream.flush()?;
                return Err(err);
            }
            Err(e) => return Err(e),
        };

        metrics.record_session_activity(session_id);
        session_tracker.record_activity(session_id);
        let msg_type = header.msg_type;
        let req_id = header.req_id;

        // Only HELLO is accepted before the session is authenticated; any
        // other message is rejected and the connection is closed.
        if !client_tag_received && msg_type != MsgType::Hello as u16 {
            metrics.record_error("binary");
            let err = StoreError::InvalidInput("HELLO required before any other message".into());
            let payload = encode_error(err.code().0, &err.detail())?;
            write_frame(&mut stream, MsgType::Error as u16, 0, req_id, &payload)?;
            stream.flush()?;
            break;
        }

        let op_start = std::time::Instant::now();
        // Dispatched inside a closure so a `?` on a parse/store error inside any
        // arm below is captured as `Err` here and turned into an ERROR frame,
        // rather than propagating out of `handle_client` and silently dropping
        // the connection on every application-level error.
        let mut dispatch = || -> Result<(u16, Vec<u8>)> {
            match msg_type {
            x if x == MsgType::Hello as u16 => {
                let hello = parse_hello(&payload)?;
                // Register session with client tag and peer address
                if !client_tag_received {
                    client_tag = hello.client_tag.clone();
                    session_tracker.register(
                        session_id,
                        hello.client_tag.clone(),
                        Some(peer_addr.clone()),
                    );
                    client_tag_received = true;

                    event_bus.publish(StoreEvent::ClientConnected {
                        session_id: session_id.to_string(),
                        client_tag: hello.client_tag.clone(),
                    });
                }
                let resp = encode_hello_resp(session_id, 1)?; // protocol version 1
                Ok((MsgType::Hello as u16, resp))
            }
            x if x == MsgType::CtxCreate as u16 => {
                let base_turn_id = parse_ctx_create(&payload)?;
                let head = store.create_context(base_turn_id)?;
                // Associate context with this session
                session_tracker.add_context(session_id, head.context_id);

                event_bus.publish(StoreEvent::ContextCreated {
                    context_id: head.context_id.to_string(),
                    session_id: session_id.to_string(),
                    client_tag: client_tag.clone(),
                    created_at: unix_ms(),
                });

                let resp =
                    encode_ctx_create_resp(head.context_id, head.head_turn_id, head.head_depth)?;
                Ok((MsgType::CtxCreate as u16, resp))
            }
            x if x == MsgType::CtxFork as u16 => {
                let base_turn_id = parse_ctx_fork(&payload)?;
                let head = store.fork_context(base_turn_id)?;
                // Associate forked context with this session
                session_tracker.add_context(session_id, head.context_id);

                event_bus.publish(StoreEvent::ContextCreated {
                    context_id: head.context_id.to_string(),
                    session_id: session_id.to_string(),
                    client_tag: client_tag.clone(),
                    created_at: unix_ms(),
                });

                let resp =
                    encode_ctx_create_resp(head.context_id, head.head_turn_id, head.head_depth)?;
                Ok((MsgType::CtxFork as u16, resp))
            }
            x if x == MsgType::GetHead as u16 => {
                let context_id = parse_get_head(&payload)?;
                let head = store.get_head(context_id)?;
                let resp =
                    encode_ctx_create_resp(head.context_id, head.head_turn_id, head.head_depth)?;
                Ok((MsgType::GetHead as u16, resp))
            }
            x if x == MsgType::AppendTurn as u16 => {
                let req = parse_append_turn(&payload, header.flags)?;
                if strict_registry {
                    let known = registry
                        .lock()
                        .unwrap()
                        .get_type_version(&req.declared_type_id, req.declared_type_version)
                        .is_some();
                    if !known {
                        return Err(StoreError::PreconditionFailed(format!(
                            "strict_registry: unknown type {} version {}",
                            req.declared_type_id, req.declared_type_version
                        )));
                    }
                }
                let declared_type_id_clone = req.declared_type_id.clone();
                let declared_type_version = req.declared_type_version;
                let outcome = store.append_turn(
                    req.context_id,
                    req.parent_turn_id,
                    req.declared_type_id,
                    req.declared_type_version,
                    req.encoding,
                    req.compression,
                    req.uncompressed_len,
                    req.content_hash,
                    &req.payload_bytes,
                    &req.idempotency_key,
                )?;
                let record = outcome.record;
                // If fs_root_hash was provided, attach it to this turn. Skip
                // on replay: the original append already attached it.
                if !outcome.replayed {
                    if let Some(fs_root_hash) = req.fs_root_hash {
                        store.attach_fs(record.turn_id, fs_root_hash)?;
                    }
                    event_bus.publish(StoreEvent::TurnAppended {
                        context_id: req.context_id.to_string(),
                        turn_id: record.turn_id.to_string(),
                        parent_turn_id: record.parent_turn_id.to_string(),
                        depth: record.depth,
                        declared_type_id: Some(declared_type_id_clone),
                        declared_type_version: Some(declared_type_version),
                    });
                }
                metrics.record_append(op_start.elapsed());

                let resp = encode_append_ack(
                    req.context_id,
                    record.turn_id,
                    record.depth,
                    &record.payload_hash,
                )?;
                Ok((MsgType::AppendTurn as u16, resp))
            }
            x if x == MsgType::AttachFs as u16 => {
                let req = parse_attach_fs(&payload)?;
                store.attach_fs(req.turn_id, req.fs_root_hash)?;
                let resp = encode_attach_fs_resp(req.turn_id, &req.fs_root_hash)?;
                Ok((MsgType::AttachFs as u16, resp))
            }
            x if x == MsgType::PutBlob as u16 => {
                let req = parse_put_blob(&payload)?;
                // Verify hash matches
                let actual_hash = blake3::hash(&req.data);
                if actual_hash.as_bytes() != &req.hash {
                    return Err(StoreError::InvalidInput("blob hash mismatch".into()));
                }
                let outcome = store.blob_store.put_if_absent(req.hash, &req.data)?;
                let resp = encode_put_blob_resp(&req.hash, outcome.was_new)?;
                Ok((MsgType::PutBlob as u16, resp))
            }
            x if x == MsgType::GetLast as u16 => {
                let req = parse_get_last(&payload)?;
                let items = store.get_last(req.context_id, req.limit, req.include_payload != 0)?;
                metrics.record_get_last(op_start.elapsed());
                let mut resp = Vec::new();
                resp.write_u32::<byteorder::LittleEndian>(items.len() as u32)?;
                for item in items {
                    resp.write_u64::<byteorder::LittleEndian>(item.record.turn_id)?;
                    resp.write_u64::<byteorder::LittleEndian>(item.record.parent_turn_id)?;
                    resp.write_u32::<byteorder::LittleEndian>(item.record.depth)?;
                    resp.write_u32::<byteorder::LittleEndian>(
                        item.meta.declared_type_id.len() as u32
                    )?;
                    resp.extend_from_slice(item.meta.declared_type_id.as_bytes());
                    resp.write_u32::<byteorder::LittleEndian>(item.meta.declared_type_version)?;
                    resp.write_u32::<byteorder::LittleEndian>(item.meta.encoding)?;
                    // always return raw payload when included
                    let compression = if item.payload.is_some() {
                        0
                    } else {
                        item.meta.compression
                    };
                    resp.write_u32::<byteorder::LittleEndian>(compression)?;
                    let uncompressed_len = item
                        .payload
                        .as_ref()
                        .map(|p| p.len() as u32)
                        .unwrap_or(item.meta.uncompressed_len);
                    resp.write_u32::<byteorder::LittleEndian>(uncompressed_len)?;
                    resp.extend_from_slice(&item.record.payload_hash);
                    if let Some(payload) = item.payload {
                        resp.write_u32::<byteorder::LittleEndian>(payload.len() as u32)?;
                        resp.extend_from_slice(&payload);
                    }
                }
                Ok((MsgType::GetLast as u16, resp))
            }
            x if x == MsgType::GetBlob as u16 => {
                let hash = parse_get_blob(&payload)?;
                let bytes = store.get_blob(&hash)?;
                metrics.record_get_blob(op_start.elapsed());
                let mut resp = Vec::new();
                resp.write_u32::<byteorder::LittleEndian>(bytes.len() as u32)?;
                resp.extend_from_slice(&bytes);
                Ok((MsgType::GetBlob as u16, resp))
            }
                _ => Err(StoreError::InvalidInput("unknown msg_type".into())),
            }
        };
        let response = dispatch();

        match response {
            Ok((resp_type, resp_payload)) => {
                write_frame(&mut stream, resp_type, 0, req_id, &resp_payload)?;
                stream.flush()?;
            }
            Err(err) => {
                metrics.record_error("binary");
                let payload = encode_error(err.code().0, &err.detail())?;
                write_frame(&mut stream, MsgType::Error as u16, 0, req_id, &payload)?;
                stream.flush()?;
            }
        }
    }

    // Unregister session on disconnect and publish event
    let orphaned_contexts = session_tracker.unregister(session_id);
    event_bus.publish(StoreEvent::ClientDisconnected {
        session_id: session_id.to_string(),
        client_tag,
        contexts: orphaned_contexts.iter().map(|id| id.to_string()).collect(),
    });

    Ok(())
}

/// Get current time in milliseconds since Unix epoch.
fn unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
