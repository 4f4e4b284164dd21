//! Structured JSON line logging.
//!
//! Every log entry is a single JSON object on stdout with `ts`, `module`,
//! `lvl` and a flat field map. Skipped cycles, gate rejections, retries and
//! operator alerts each get their own event shape so monitoring can tell a
//! normal skip from a fault without parsing free text.

use chrono::Utc;
use serde_json::{json, Map, Value};

/// RFC3339 timestamp with milliseconds.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn sanitize(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "authorization", "signature", "signing_secret"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn emit(lvl: &str, module: &str, fields: Map<String, Value>) {
    let mut entry = Map::new();
    entry.insert("ts".to_string(), Value::String(ts_now()));
    entry.insert("lvl".to_string(), Value::String(lvl.to_string()));
    entry.insert("module".to_string(), Value::String(module.to_string()));
    for (k, v) in sanitize(fields) {
        entry.insert(k, v);
    }
    println!("{}", Value::Object(entry));
}

/// Emit an info-level structured entry.
pub fn json_log(module: &str, fields: Map<String, Value>) {
    emit("info", module, fields);
}

/// Emit a warn-level entry (expected but noteworthy: skips, rejections,
/// retries, stale fallbacks).
pub fn warn_log(module: &str, fields: Map<String, Value>) {
    emit("warn", module, fields);
}

/// Operator alert. Reserved for fatal submission failures and authoritative
/// reverts that diverge from the off-chain rationale.
pub fn alert(module: &str, mut fields: Map<String, Value>) {
    fields.insert("alert".to_string(), Value::Bool(true));
    emit("error", module, fields);
}

/// Deterministic short hash for correlating log lines with payloads.
pub fn params_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut h);
    format!("{:x}", h.finish())
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
