// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! HTTP read gateway: a JSON view over the Turn store and registry.
//!
//! This surface never mutates the Turn DAG or the blob CAS — writes to
//! turns/contexts only happen over the binary protocol (see `protocol` and
//! `main::handle_client`). The one exception is the registry, whose `PUT` is
//! explicitly the recommended publication path for type bundles.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::Engine;
use serde_json::{json, Map, Value as JsonValue};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{info, warn};
use url::Url;

use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::fs_store::EntryKind;
use crate::metrics::{Metrics, SessionTracker};
use crate::projection::{BytesRender, EnumRender, RenderOptions, TimeRender, U64Format};
use crate::registry::{PutOutcome, Registry, RegistryBundle, TypeVersionSpec};
use crate::store::Store;

type HttpResponse = (u16, Response<std::io::Cursor<Vec<u8>>>);

pub fn start_http(
    bind_addr: String,
    store: Arc<Store>,
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<Metrics>,
    session_tracker: Arc<SessionTracker>,
    event_bus: Arc<EventBus>,
) -> Result<std::thread::JoinHandle<()>> {
    let server = Server::http(&bind_addr)
        .map_err(|e| StoreError::InvalidInput(format!("http bind error: {e}")))?;
    let handle = std::thread::spawn(move || {
        for request in server.incoming_requests() {
            if let Err(err) = handle_request(request, &store, &registry, &metrics, &event_bus) {
                warn!(error = %err, "http error");
            }
        }
        // session_tracker is not consulted by this read-only gateway today,
        // but stays wired in so a future endpoint (e.g. live-session
        // introspection) doesn't need to thread it through start_http again.
        let _ = session_tracker;
    });
    Ok(handle)
}

fn handle_request(
    mut request: tiny_http::Request,
    store: &Arc<Store>,
    registry: &Arc<Mutex<Registry>>,
    metrics: &Arc<Metrics>,
    event_bus: &Arc<EventBus>,
) -> Result<()> {
    let start = Instant::now();
    let request_path = request.url().to_string();

    let result: Result<HttpResponse> = (|| {
        let method = request.method().clone();
        let url_str = format!("http://localhost{}", request.url());
        let url =
            Url::parse(&url_str).map_err(|_| StoreError::InvalidInput("invalid url".into()))?;
        let segments: Vec<String> = url
            .path_segments()
            .map(|c| c.map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let segments_ref: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

        match (method, segments_ref.as_slice()) {
            (Method::Get, ["healthz"]) => Ok((
                200,
                Response::from_data(b"ok".to_vec())
                    .with_status_code(StatusCode(200))
                    .with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"text/plain"[..]).unwrap(),
                    ),
            )),

            (Method::Put, ["v1", "registry", "bundles", _bundle_id_raw]) => {
                let mut body = Vec::new();
                request.as_reader().read_to_end(&mut body)?;
                let bundle: RegistryBundle = serde_json::from_slice(&body)
                    .map_err(|e| StoreError::InvalidInput(format!("invalid json: {e}")))?;
                let body_id = bundle.bundle_id.clone();
                let mut registry = registry.lock().unwrap();
                match registry.put_bundle(&body_id, &body)? {
                    PutOutcome::AlreadyExists => Ok((
                        204,
                        Response::from_data(Vec::new()).with_status_code(StatusCode(204)),
                    )),
                    PutOutcome::Created => {
                        metrics.record_registry_ingest();
                        event_bus.publish(StoreEvent::ContextCreated {
                            context_id: format!("registry:{body_id}"),
                            session_id: "http".to_string(),
                            client_tag: "registry-put".to_string(),
                            created_at: unix_ms(),
                        });
                        let bytes =
                            serde_json::to_vec(&json!({"bundle_id": body_id})).map_err(|e| {
                                StoreError::InvalidInput(format!("json encode error: {e}"))
                            })?;
                        Ok((
                            201,
                            json_response(201, bytes),
                        ))
                    }
                }
            }
            (Method::Get, ["v1", "registry", "bundles", bundle_id]) => {
                let registry = registry.lock().unwrap();
                let bundle = registry
                    .get_bundle(bundle_id)
                    .ok_or_else(|| StoreError::NotFound("bundle".into()))?;
                let etag = format!("\"{}\"", blake3::hash(bundle).to_hex());
                if let Some(header) = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("If-None-Match"))
                {
                    if header.value.as_str() == etag {
                        return Ok((
                            304,
                            Response::from_data(Vec::new()).with_status_code(StatusCode(304)),
                        ));
                    }
                }
                Ok((
                    200,
                    json_response(200, bundle.to_vec())
                        .with_header(Header::from_bytes(&b"ETag"[..], etag.as_bytes()).unwrap()),
                ))
            }
            (Method::Get, ["v1", "registry", "types", type_id, "versions", version]) => {
                let version: u32 = version
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid version".into()))?;
                let registry = registry.lock().unwrap();
                let spec = registry
                    .get_type_version(type_id, version)
                    .ok_or_else(|| StoreError::NotFound("type version".into()))?;
                let json = type_version_to_json(spec);
                let bytes = serde_json::to_vec(&json)
                    .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
                Ok((200, json_response(200, bytes)))
            }

            (Method::Get, ["v1", "contexts", context_id, "turns"]) => {
                let context_id: u64 = context_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid context_id".into()))?;
                handle_get_turns(context_id, &url, store, registry, metrics)
            }

            // Ambient observability, not part of the enumerated HTTP surface
            // but carried the way the teacher carries it: a snapshot of the
            // same counters `tracing` logs incrementally.
            (Method::Get, ["v1", "metrics"]) => {
                let registry = registry.lock().unwrap();
                let snapshot = metrics.snapshot(store, &registry);
                let bytes = serde_json::to_vec(&snapshot)
                    .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
                Ok((200, json_response(200, bytes)))
            }

            // Filesystem snapshot views: per §4.5, the HTTP view that serves
            // fs/ paths walks tree blobs on demand and 404s on a missing
            // blob without failing the turn.
            (Method::Get, ["v1", "turns", turn_id, "fs"]) => {
                let turn_id: u64 = turn_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid turn_id".into()))?;
                let params = parse_query(url.query().unwrap_or(""));
                let path = params.get("path").map(|s| s.as_str()).unwrap_or("");
                fs_listing_response(store, turn_id, path)
            }
            (Method::Get, ["v1", "turns", turn_id, "fs", rest @ ..]) => {
                let turn_id: u64 = turn_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid turn_id".into()))?;
                let path = rest.join("/");
                if path.is_empty() {
                    return Err(StoreError::InvalidInput("empty file path".into()));
                }
                let params = parse_query(url.query().unwrap_or(""));
                let as_json = params.get("format").map(|s| s.as_str()) == Some("json");
                fs_file_response(store, turn_id, &path, as_json)
            }

            _ => Err(StoreError::NotFound("route".into())),
        }
    })();

    match result {
        Ok((status, response)) => {
            metrics.record_http(status, start.elapsed());
            request.respond(response).map_err(StoreError::Io)
        }
        Err(err) => {
            let status = err.code().0;
            let message = err.detail();
            metrics.record_http(status, start.elapsed());
            metrics.record_error("http");
            info!(status, path = %request_path, message = %message, "http error response");
            let bytes = serde_json::to_vec(&json!({"error": {"code": status, "message": message}}))
                .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
            let response = Response::from_data(bytes)
                .with_status_code(StatusCode(status))
                .with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
            request.respond(response).map_err(StoreError::Io)
        }
    }
}

fn handle_get_turns(
    context_id: u64,
    url: &Url,
    store: &Arc<Store>,
    registry: &Arc<Mutex<Registry>>,
    metrics: &Arc<Metrics>,
) -> Result<HttpResponse> {
    let params = parse_query(url.query().unwrap_or(""));
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);
    let before_turn_id = params
        .get("before_turn_id")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let view = params.get("view").map(|v| v.as_str()).unwrap_or("typed");
    let type_hint_mode = params
        .get("type_hint_mode")
        .map(|v| v.as_str())
        .unwrap_or("inherit");

    let bytes_render = match params.get("bytes_render").map(|v| v.as_str()) {
        Some("hex") => BytesRender::Hex,
        Some("len_only") => BytesRender::LenOnly,
        _ => BytesRender::Base64,
    };
    let u64_format = match params.get("u64_format").map(|v| v.as_str()) {
        Some("number") => U64Format::Number,
        _ => U64Format::String,
    };
    let enum_render = match params.get("enum_render").map(|v| v.as_str()) {
        Some("number") => EnumRender::Number,
        Some("both") => EnumRender::Both,
        _ => EnumRender::Label,
    };
    let time_render = match params.get("time_render").map(|v| v.as_str()) {
        Some("unix_ms") => TimeRender::UnixMs,
        _ => TimeRender::Iso,
    };
    let include_unknown = params
        .get("include_unknown")
        .map(|v| v == "1")
        .unwrap_or(false);

    let as_type_id = params.get("as_type_id").cloned();
    let as_type_version = params
        .get("as_type_version")
        .and_then(|v| v.parse::<u32>().ok());

    let options = RenderOptions {
        bytes_render,
        u64_format,
        enum_render,
        time_render,
        include_unknown,
    };

    let head = store.get_head(context_id)?;
    let t0 = Instant::now();
    let turns = if before_turn_id == 0 {
        store.get_last(context_id, limit, true)?
    } else {
        store.get_before(context_id, before_turn_id, limit, true)?
    };
    metrics.record_get_last(t0.elapsed());

    let registry = registry.lock().unwrap();
    let mut out_turns = Vec::new();
    for item in turns.iter() {
        let declared_type_id = item.meta.declared_type_id.clone();
        let declared_type_version = item.meta.declared_type_version;

        let (decoded_type_id, decoded_type_version) = match type_hint_mode {
            "explicit" => {
                let id = as_type_id
                    .clone()
                    .ok_or_else(|| StoreError::InvalidInput("as_type_id required".into()))?;
                let ver = as_type_version
                    .ok_or_else(|| StoreError::InvalidInput("as_type_version required".into()))?;
                (id, ver)
            }
            "latest" => {
                let latest = registry
                    .get_latest_type_version(&declared_type_id)
                    .ok_or_else(|| StoreError::FailedDependency("type descriptor".into()))?;
                (declared_type_id.clone(), latest.version)
            }
            _ => (declared_type_id.clone(), declared_type_version),
        };

        let mut turn_obj = Map::new();
        turn_obj.insert(
            "turn_id".into(),
            JsonValue::String(item.record.turn_id.to_string()),
        );
        turn_obj.insert(
            "parent_turn_id".into(),
            JsonValue::String(item.record.parent_turn_id.to_string()),
        );
        turn_obj.insert("depth".into(), JsonValue::Number(item.record.depth.into()));
        turn_obj.insert(
            "declared_type".into(),
            json!({
                "type_id": declared_type_id,
                "type_version": declared_type_version,
            }),
        );

        if view == "typed" || view == "both" {
            let desc = registry
                .get_type_version(&decoded_type_id, decoded_type_version)
                .ok_or_else(|| StoreError::FailedDependency("type descriptor".into()))?;
            let payload = item
                .payload
                .as_ref()
                .ok_or_else(|| StoreError::InvalidInput("payload not loaded".into()))?;
            let projected = crate::projection::project_msgpack(payload, desc, &registry, &options)?;
            turn_obj.insert(
                "decoded_as".into(),
                json!({
                    "type_id": decoded_type_id,
                    "type_version": decoded_type_version,
                }),
            );
            turn_obj.insert("data".into(), projected.data);
            if let Some(unknown) = projected.unknown {
                turn_obj.insert("unknown".into(), unknown);
            }
        }

        if view == "raw" || view == "both" {
            let raw_payload = item
                .payload
                .as_ref()
                .ok_or_else(|| StoreError::InvalidInput("payload not loaded".into()))?;
            turn_obj.insert(
                "content_hash_b3".into(),
                JsonValue::String(hex::encode(item.record.payload_hash)),
            );
            turn_obj.insert(
                "encoding".into(),
                JsonValue::Number(item.meta.encoding.into()),
            );
            turn_obj.insert("compression".into(), JsonValue::Number(0u32.into()));
            turn_obj.insert(
                "uncompressed_len".into(),
                JsonValue::Number((raw_payload.len() as u32).into()),
            );
            match bytes_render {
                BytesRender::Base64 => {
                    turn_obj.insert(
                        "bytes_b64".into(),
                        JsonValue::String(
                            base64::engine::general_purpose::STANDARD.encode(raw_payload),
                        ),
                    );
                }
                BytesRender::Hex => {
                    turn_obj.insert(
                        "bytes_hex".into(),
                        JsonValue::String(hex::encode(raw_payload)),
                    );
                }
                BytesRender::LenOnly => {
                    turn_obj.insert(
                        "bytes_len".into(),
                        JsonValue::Number((raw_payload.len() as u64).into()),
                    );
                }
            }
        }

        out_turns.push(JsonValue::Object(turn_obj));
    }

    let next_before = turns.first().map(|t| t.record.turn_id.to_string());
    let meta = json!({
        "context_id": context_id.to_string(),
        "head_turn_id": head.head_turn_id.to_string(),
        "head_depth": head.head_depth,
        "registry_bundle_id": registry.last_bundle_id(),
    });

    let resp = json!({
        "meta": meta,
        "turns": out_turns,
        "next_before_turn_id": next_before,
    });

    let bytes = serde_json::to_vec(&resp)
        .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
    Ok((200, json_response(200, bytes)))
}

fn fs_listing_response(store: &Store, turn_id: u64, path: &str) -> Result<HttpResponse> {
    let fs_root = store
        .get_fs_root(turn_id)
        .ok_or_else(|| StoreError::NotFound("no fs snapshot for turn".into()))?;
    let entries = store.list_fs_entries(turn_id, path)?;
    let resp = json!({
        "turn_id": turn_id.to_string(),
        "path": path,
        "fs_root_hash": hex::encode(fs_root),
        "entries": entries_to_json(&entries),
    });
    let bytes = serde_json::to_vec(&resp)
        .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
    Ok((200, json_response(200, bytes)))
}

fn fs_file_response(
    store: &Store,
    turn_id: u64,
    path: &str,
    as_json: bool,
) -> Result<HttpResponse> {
    match store.get_fs_file(turn_id, path) {
        Ok((content, entry)) => {
            if as_json {
                let resp = json!({
                    "turn_id": turn_id.to_string(),
                    "path": path,
                    "name": entry.name,
                    "kind": EntryKind::from(entry.kind).as_str(),
                    "size": entry.size,
                    "hash": hex::encode(&entry.hash),
                    "content_base64": base64::engine::general_purpose::STANDARD.encode(&content),
                });
                let bytes = serde_json::to_vec(&resp)
                    .map_err(|e| StoreError::InvalidInput(format!("json encode error: {e}")))?;
                Ok((200, json_response(200, bytes)))
            } else {
                let content_type = guess_content_type(path);
                Ok((
                    200,
                    Response::from_data(content)
                        .with_status_code(StatusCode(200))
                        .with_header(
                            Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                                .unwrap(),
                        )
                        .with_header(
                            Header::from_bytes(
                                &b"X-Fs-Hash"[..],
                                hex::encode(&entry.hash).as_bytes(),
                            )
                            .unwrap(),
                        ),
                ))
            }
        }
        Err(StoreError::InvalidInput(msg)) if msg.contains("directory") => {
            fs_listing_response(store, turn_id, path)
        }
        Err(e) => Err(e),
    }
}

fn entries_to_json(entries: &[crate::fs_store::TreeEntry]) -> Vec<JsonValue> {
    entries
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "kind": EntryKind::from(e.kind).as_str(),
                "size": e.size,
                "hash": hex::encode(&e.hash),
            })
        })
        .collect()
}

fn json_response(status: u16, bytes: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_data(bytes)
        .with_status_code(StatusCode(status))
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap())
}

fn type_version_to_json(spec: &TypeVersionSpec) -> JsonValue {
    use crate::registry::ItemsSpec;

    let mut fields = Map::new();
    for (tag, field) in spec.fields.iter() {
        let mut obj = Map::new();
        obj.insert("name".into(), JsonValue::String(field.name.clone()));
        obj.insert("type".into(), JsonValue::String(field.field_type.clone()));
        if let Some(enum_ref) = &field.enum_ref {
            obj.insert("enum".into(), JsonValue::String(enum_ref.clone()));
        }
        if let Some(type_ref) = &field.type_ref {
            obj.insert("ref".into(), JsonValue::String(type_ref.clone()));
        }
        if let Some(items) = &field.items {
            match items {
                ItemsSpec::Simple(s) => {
                    obj.insert("items".into(), JsonValue::String(s.clone()));
                }
                ItemsSpec::Ref(r) => {
                    obj.insert("items".into(), json!({"type": "ref", "ref": r}));
                }
            }
        }
        if field.optional {
            obj.insert("optional".into(), JsonValue::Bool(true));
        }
        fields.insert(tag.to_string(), JsonValue::Object(obj));
    }
    let mut result = Map::new();
    result.insert("version".into(), JsonValue::Number(spec.version.into()));
    result.insert("fields".into(), JsonValue::Object(fields));
    JsonValue::Object(result)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Guess content type from file extension.
fn guess_content_type(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "rs" => "text/x-rust",
        "go" => "text/x-go",
        "py" => "text/x-python",
        "rb" => "text/x-ruby",
        "java" => "text/x-java",
        "c" | "h" => "text/x-c",
        "cpp" | "cc" | "cxx" | "hpp" => "text/x-c++",
        "ts" => "text/typescript",
        "tsx" => "text/typescript-jsx",
        "jsx" => "text/javascript-jsx",
        "yaml" | "yml" => "text/yaml",
        "toml" => "text/toml",
        "sh" | "bash" => "text/x-shellscript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_decodes_form_encoded_params() {
        let params = parse_query("limit=10&view=raw&as_type_id=cxdb%3AMessage");
        assert_eq!(params.get("limit").map(|s| s.as_str()), Some("10"));
        assert_eq!(params.get("view").map(|s| s.as_str()), Some("raw"));
        assert_eq!(
            params.get("as_type_id").map(|s| s.as_str()),
            Some("cxdb:Message")
        );
    }

    #[test]
    fn guess_content_type_matches_known_extensions() {
        assert_eq!(guess_content_type("notes.md"), "text/markdown");
        assert_eq!(guess_content_type("main.rs"), "text/x-rust");
        assert_eq!(guess_content_type("unknownfile"), "application/octet-stream");
    }
}
