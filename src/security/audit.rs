use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::info;

/// Structured audit trail for dispatched operations. Records go through
/// `tracing` at INFO under the `audit` target so operators can route them
/// to a dedicated sink.
#[derive(Clone)]
pub struct AuditLog {
    enabled: bool,
}

impl AuditLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn success(
        &self,
        client: &str,
        tool: &str,
        model: Option<&str>,
        method: Option<&str>,
        arg_digest: &str,
        result_summary: &str,
        duration: Duration,
    ) {
        if !self.enabled {
            return;
        }
        info!(
            target: "audit",
            client,
            tool,
            model = model.unwrap_or("-"),
            method = method.unwrap_or("-"),
            arg_digest,
            result = result_summary,
            duration_ms = duration.as_millis() as u64,
            "dispatch ok"
        );
    }

    pub fn failure(
        &self,
        client: &str,
        tool: &str,
        model: Option<&str>,
        method: Option<&str>,
        arg_digest: &str,
        error_kind: &str,
        error_code: i64,
        duration: Duration,
    ) {
        if !self.enabled {
            return;
        }
        info!(
            target: "audit",
            client,
            tool,
            model = model.unwrap_or("-"),
            method = method.unwrap_or("-"),
            arg_digest,
            error_kind,
            error_code,
            duration_ms = duration.as_millis() as u64,
            "dispatch failed"
        );
    }
}

/// Short stable digest of the (canonicalized) arguments, so audit lines
/// never carry raw payloads.
pub fn arg_digest(value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

/// Serialize with recursively sorted object keys so logically equal
/// payloads digest identically.
pub fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::Value::String(k.clone()), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

fn hex_prefix(bytes: &[u8], take: usize) -> String {
    bytes
        .iter()
        .take(take)
        .map(|b| format!("{b:02x}"))
        .collect()
}
