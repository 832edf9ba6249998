//! Typed message models and their content-addressed schema digests.
//!
//! A digest is computed from the JSON schema of a model with every
//! human-readable annotation removed, so documentation edits never change
//! wire compatibility. The live schema is never touched: stripping happens on
//! a scratch copy and the result is memoized per type.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};

pub const MODEL_DIGEST_PREFIX: &str = "model:";

/// Schema keywords that carry documentation only.
const ANNOTATION_KEYS: &[&str] = &["description", "examples", "$schema", "$comment"];

/// A message type that can travel inside an envelope.
///
/// Implement it with an empty `impl Model for MyMessage {}` on a struct that
/// derives `Serialize`, `Deserialize` and `JsonSchema`.
pub trait Model: Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static {
    fn schema_digest() -> Result<String> {
        schema_digest::<Self>()
    }
}

/// Name, digest and stripped schema of a model type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub digest: String,
    pub schema: Value,
}

impl ModelInfo {
    pub fn of<M: Model>() -> Result<ModelInfo> {
        model_info::<M>().map(|info| info.as_ref().clone())
    }
}

static MODEL_CACHE: OnceLock<RwLock<HashMap<TypeId, Arc<ModelInfo>>>> = OnceLock::new();

fn model_info<M: Model>() -> Result<Arc<ModelInfo>> {
    let cache = MODEL_CACHE.get_or_init(Default::default);
    let type_id = TypeId::of::<M>();

    if let Some(info) = cache
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&type_id)
    {
        return Ok(Arc::clone(info));
    }

    let schema = serde_json::to_value(schemars::schema_for!(M))?;
    let stripped = strip_annotations(&schema);
    let digest = digest_stripped(&stripped)?;
    let info = Arc::new(ModelInfo {
        name: M::schema_name(),
        digest,
        schema: stripped,
    });

    // First writer wins; a racing computation produced the same value.
    let mut guard = cache.write().unwrap_or_else(|e| e.into_inner());
    Ok(Arc::clone(guard.entry(type_id).or_insert(info)))
}

/// Schema digest of a model type, `model:<sha256 hex>`.
pub fn schema_digest<M: Model>() -> Result<String> {
    model_info::<M>().map(|info| info.digest.clone())
}

/// Compute a schema digest from a raw JSON schema document.
pub fn build_schema_digest(schema: &Value) -> Result<String> {
    digest_stripped(&strip_annotations(schema))
}

fn digest_stripped(schema: &Value) -> Result<String> {
    ensure_structured(schema)?;
    let hash = Sha256::digest(canonical_json(schema).as_bytes());
    Ok(format!("{}{}", MODEL_DIGEST_PREFIX, hex::encode(hash)))
}

/// Models must be named structures (objects or unions of objects).
fn ensure_structured(schema: &Value) -> Result<()> {
    let Value::Object(map) = schema else {
        return Err(Error::Schema("schema root must be a JSON object".to_string()));
    };
    let is_object = map.get("type").and_then(Value::as_str) == Some("object");
    let is_union = ["oneOf", "anyOf", "allOf"]
        .iter()
        .any(|key| map.contains_key(*key));
    if is_object || is_union {
        Ok(())
    } else {
        let name = map
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("<untitled>");
        Err(Error::Schema(format!(
            "{} is not a structured model",
            name
        )))
    }
}

/// Return a copy of `schema` with documentation keywords removed at every level.
fn strip_annotations(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if ANNOTATION_KEYS.contains(&key.as_str()) {
                    continue;
                }
                // Property names are data, not keywords.
                let value = if key == "properties" || key == "definitions" || key == "$defs" {
                    match value {
                        Value::Object(props) => Value::Object(
                            props
                                .iter()
                                .map(|(name, prop)| (name.clone(), strip_annotations(prop)))
                                .collect(),
                        ),
                        other => strip_annotations(other),
                    }
                } else {
                    strip_annotations(value)
                };
                out.insert(key.clone(), value);
            }
            unwrap_single_all_of(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_annotations).collect()),
        other => other.clone(),
    }
}

/// A documented reference is emitted as `{"allOf": [{"$ref": ..}]}`; once the
/// description is gone it is the same as the bare reference.
fn unwrap_single_all_of(mut map: Map<String, Value>) -> Value {
    if map.len() == 1 {
        if let Some(Value::Array(items)) = map.get("allOf") {
            if items.len() == 1 {
                if let Some(Value::Array(mut items)) = map.remove("allOf") {
                    return items.remove(0);
                }
            }
        }
    }
    Value::Object(map)
}

/// Serialize JSON with object keys sorted and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
