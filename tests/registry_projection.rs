// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use cxdb_server::projection::project_msgpack;
use cxdb_server::projection::{BytesRender, EnumRender, RenderOptions, TimeRender, U64Format};
use cxdb_server::registry::Registry;
use rmpv::Value;
use tempfile::tempdir;

fn default_options() -> RenderOptions {
    RenderOptions {
        bytes_render: BytesRender::Base64,
        u64_format: U64Format::String,
        enum_render: EnumRender::Label,
        time_render: TimeRender::Iso,
        include_unknown: true,
    }
}

#[test]
fn registry_ingest_and_project() {
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let bundle = r#"
    {
      "registry_version": 1,
      "bundle_id": "2025-12-19T00:00:00Z#test",
      "types": {
        "com.example.Message": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "role", "type": "u8", "enum": "com.example.Role" },
                "2": { "name": "text", "type": "string" }
              }
            }
          }
        }
      },
      "enums": {
        "com.example.Role": { "1": "system", "2": "user" }
      }
    }
    "#;

    registry
        .put_bundle("2025-12-19T00:00:00Z#test", bundle.as_bytes())
        .expect("put bundle");

    let desc = registry
        .get_type_version("com.example.Message", 1)
        .expect("descriptor");

    let map = vec![
        (Value::Integer(1.into()), Value::Integer(2.into())),
        (Value::Integer(2.into()), Value::String("hello".into())),
        (Value::Integer(9.into()), Value::Integer(42.into())),
    ];
    let value = Value::Map(map);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encode msgpack");

    let options = RenderOptions {
        bytes_render: BytesRender::Base64,
        u64_format: U64Format::String,
        enum_render: EnumRender::Label,
        time_render: TimeRender::Iso,
        include_unknown: true,
    };

    let projection = project_msgpack(&buf, desc, &registry, &options).expect("project");
    let data = projection.data.as_object().expect("data object");
    assert_eq!(data.get("role").unwrap().as_str().unwrap(), "user");
    assert_eq!(data.get("text").unwrap().as_str().unwrap(), "hello");

    let unknown = projection.unknown.expect("unknown");
    let unknown_obj = unknown.as_object().expect("unknown object");
    assert!(unknown_obj.contains_key("9"));
}

#[test]
fn nested_type_references() {
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    // Bundle with nested type references
    let bundle = r#"
    {
      "registry_version": 1,
      "bundle_id": "nested-test",
      "types": {
        "test:Item": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "item_type", "type": "string" },
                "2": { "name": "nested", "type": "ref", "ref": "test:Nested" },
                "3": { "name": "items", "type": "array", "items": { "type": "ref", "ref": "test:ArrayItem" } }
              }
            }
          }
        },
        "test:Nested": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "name", "type": "string" },
                "2": { "name": "value", "type": "int64" }
              }
            }
          }
        },
        "test:ArrayItem": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "id", "type": "string" },
                "2": { "name": "count", "type": "int32" }
              }
            }
          }
        }
      },
      "enums": {}
    }
    "#;

    registry
        .put_bundle("nested-test", bundle.as_bytes())
        .expect("put bundle");
    let desc = registry
        .get_type_version("test:Item", 1)
        .expect("descriptor");

    // Item { item_type: "foo", nested: { name: "bar", value: 42 }, items: [{ id: "x", count: 1 }] }
    let nested_map = vec![
        (Value::Integer(1.into()), Value::String("bar".into())),
        (Value::Integer(2.into()), Value::Integer(42.into())),
    ];
    let array_item = vec![
        (Value::Integer(1.into()), Value::String("x".into())),
        (Value::Integer(2.into()), Value::Integer(1.into())),
    ];
    let root_map = vec![
        (Value::Integer(1.into()), Value::String("foo".into())),
        (Value::Integer(2.into()), Value::Map(nested_map)),
        (
            Value::Integer(3.into()),
            Value::Array(vec![Value::Map(array_item)]),
        ),
    ];
    let value = Value::Map(root_map);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encode msgpack");

    let projection = project_msgpack(&buf, desc, &registry, &default_options()).expect("project");
    let data = projection.data.as_object().expect("data object");

    assert_eq!(data.get("item_type").unwrap().as_str().unwrap(), "foo");

    let nested = data
        .get("nested")
        .unwrap()
        .as_object()
        .expect("nested object");
    assert_eq!(nested.get("name").unwrap().as_str().unwrap(), "bar");
    assert_eq!(nested.get("value").unwrap().as_str().unwrap(), "42"); // u64 formatted as string

    let items = data.get("items").unwrap().as_array().expect("items array");
    assert_eq!(items.len(), 1);
    let first_item = items[0].as_object().expect("first item");
    assert_eq!(first_item.get("id").unwrap().as_str().unwrap(), "x");
    assert_eq!(first_item.get("count").unwrap().as_i64().unwrap(), 1);
}

#[test]
fn map_with_ref_recursively_projects() {
    // A bundle schema may use `"type": "map"` with a separate `"ref"`
    // attribute for nested types. The projection engine must treat this the
    // same as `"type": "ref"` and recursively decode nested fields to named
    // keys.
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let bundle = r#"
    {
      "registry_version": 1,
      "bundle_id": "map-ref-test",
      "types": {
        "test:Outer": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "item_type", "type": "string" },
                "13": { "name": "handoff", "type": "map", "ref": "test:Inner", "optional": true }
              }
            }
          }
        },
        "test:Inner": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "from_agent", "type": "string" },
                "2": { "name": "to_agent", "type": "string" },
                "5": { "name": "reason", "type": "string" }
              }
            }
          }
        }
      },
      "enums": {}
    }
    "#;

    registry
        .put_bundle("map-ref-test", bundle.as_bytes())
        .expect("put bundle");
    let desc = registry
        .get_type_version("test:Outer", 1)
        .expect("descriptor");

    // Outer { item_type: "handoff", handoff: Inner { from_agent: "root", to_agent: "explorer", reason: "delegation" } }
    let inner_map = vec![
        (Value::Integer(1.into()), Value::String("root".into())),
        (Value::Integer(2.into()), Value::String("explorer".into())),
        (Value::Integer(5.into()), Value::String("delegation".into())),
    ];
    let root_map = vec![
        (Value::Integer(1.into()), Value::String("handoff".into())),
        (Value::Integer(13.into()), Value::Map(inner_map)),
    ];
    let value = Value::Map(root_map);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encode msgpack");

    let projection = project_msgpack(&buf, desc, &registry, &default_options()).expect("project");
    let data = projection.data.as_object().expect("data object");

    assert_eq!(data.get("item_type").unwrap().as_str().unwrap(), "handoff");

    let handoff = data
        .get("handoff")
        .expect("handoff field present")
        .as_object()
        .expect("handoff is object");
    assert_eq!(handoff.get("from_agent").unwrap().as_str().unwrap(), "root");
    assert_eq!(
        handoff.get("to_agent").unwrap().as_str().unwrap(),
        "explorer"
    );
    assert_eq!(
        handoff.get("reason").unwrap().as_str().unwrap(),
        "delegation"
    );

    // Numeric tag keys must not leak into the typed view.
    assert!(handoff.get("1").is_none());
    assert!(handoff.get("2").is_none());
}

#[test]
fn array_shorthand_ref_recursively_projects() {
    // `"items": { "ref": "T" }` (without `"type": "ref"`) is shorthand the
    // registry parser must treat the same as the long form.
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let bundle = r#"
    {
      "registry_version": 1,
      "bundle_id": "shorthand-ref-test",
      "types": {
        "test:Parent": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "label", "type": "string" },
                "2": { "name": "children", "type": "array", "items": { "ref": "test:Child" }, "optional": true }
              }
            }
          }
        },
        "test:Child": {
          "versions": {
            "1": {
              "fields": {
                "1": { "name": "name", "type": "string" },
                "2": { "name": "score", "type": "int32" }
              }
            }
          }
        }
      },
      "enums": {}
    }
    "#;

    registry
        .put_bundle("shorthand-ref-test", bundle.as_bytes())
        .expect("put bundle");
    let desc = registry
        .get_type_version("test:Parent", 1)
        .expect("descriptor");

    // Parent { label: "grp", children: [Child { name: "a", score: 10 }] }
    let child_map = vec![
        (Value::Integer(1.into()), Value::String("a".into())),
        (Value::Integer(2.into()), Value::Integer(10.into())),
    ];
    let root_map = vec![
        (Value::Integer(1.into()), Value::String("grp".into())),
        (
            Value::Integer(2.into()),
            Value::Array(vec![Value::Map(child_map)]),
        ),
    ];
    let value = Value::Map(root_map);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encode msgpack");

    let projection = project_msgpack(&buf, desc, &registry, &default_options()).expect("project");
    let data = projection.data.as_object().expect("data object");

    assert_eq!(data.get("label").unwrap().as_str().unwrap(), "grp");

    let children = data
        .get("children")
        .unwrap()
        .as_array()
        .expect("children array");
    assert_eq!(children.len(), 1);

    let child = children[0].as_object().expect("child object");
    assert_eq!(child.get("name").unwrap().as_str().unwrap(), "a");
    assert_eq!(child.get("score").unwrap().as_i64().unwrap(), 10);
    assert!(child.get("1").is_none());
}

#[test]
fn type_version_monotonic_enforcement_rejects_lower_version() {
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let v1 = r#"
    {
      "registry_version": 1,
      "bundle_id": "mono-v1",
      "types": {
        "test:Mono": {
          "versions": {
            "2": { "fields": { "1": { "name": "a", "type": "string" } } }
          }
        }
      },
      "enums": {}
    }
    "#;
    registry.put_bundle("mono-v1", v1.as_bytes()).expect("put v1");

    let regression = r#"
    {
      "registry_version": 1,
      "bundle_id": "mono-v2",
      "types": {
        "test:Mono": {
          "versions": {
            "1": { "fields": { "1": { "name": "a", "type": "string" } } }
          }
        }
      },
      "enums": {}
    }
    "#;
    let err = registry
        .put_bundle("mono-v2", regression.as_bytes())
        .expect_err("lower version for an existing type must be rejected");
    assert_eq!(err.code().0, 409);
}

#[test]
fn tag_reuse_with_changed_optionality_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let v1 = r#"
    {
      "registry_version": 1,
      "bundle_id": "optional-v1",
      "types": {
        "test:Opt": {
          "versions": {
            "1": { "fields": { "1": { "name": "a", "type": "string" } } }
          }
        }
      },
      "enums": {}
    }
    "#;
    registry
        .put_bundle("optional-v1", v1.as_bytes())
        .expect("put v1");

    // Same tag, same declared type, but now marked optional: true. Per
    // §4.6 rule 3 this is an incompatible re-declaration, not a benign
    // widening, so it must be rejected rather than silently accepted.
    let v2 = r#"
    {
      "registry_version": 1,
      "bundle_id": "optional-v2",
      "types": {
        "test:Opt": {
          "versions": {
            "2": { "fields": { "1": { "name": "a", "type": "string", "optional": true } } }
          }
        }
      },
      "enums": {}
    }
    "#;
    let err = registry
        .put_bundle("optional-v2", v2.as_bytes())
        .expect_err("changed optionality on a reused tag must be rejected");
    assert_eq!(err.code().0, 409);
}

// Exercises the exact lookup strict_registry mode uses to reject an
// APPEND_TURN with an unregistered declared type/version before any
// storage mutation happens.
#[test]
fn get_type_version_distinguishes_known_from_unknown() {
    let dir = tempdir().expect("tempdir");
    let mut registry = Registry::open(dir.path()).expect("open registry");

    let bundle = r#"
    {
      "registry_version": 1,
      "bundle_id": "strict-mode",
      "types": {
        "test:Known": {
          "versions": {
            "1": { "fields": { "1": { "name": "a", "type": "string" } } }
          }
        }
      },
      "enums": {}
    }
    "#;
    registry
        .put_bundle("strict-mode", bundle.as_bytes())
        .expect("put bundle");

    assert!(registry.get_type_version("test:Known", 1).is_some());
    assert!(registry.get_type_version("test:Known", 2).is_none());
    assert!(registry.get_type_version("test:Unknown", 1).is_none());
}
