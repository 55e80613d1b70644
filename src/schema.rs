use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult, ValidationKind};
use crate::odoo::pool::ConnectionPool;

/// Field attributes requested from `fields_get`.
const FIELD_ATTRIBUTES: &[&str] = &[
    "string", "type", "required", "readonly", "relation", "selection", "store",
];

/// Flattened field definition served by `odoo.schema.fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ttype: String,
    pub required: bool,
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<(String, String)>>,
    pub store: bool,
}

struct TrackerState {
    version: Option<(String, Instant)>,
    fields: HashMap<String, (Value, Instant)>,
}

/// Schema introspection with TTL caching and an opaque version fingerprint.
///
/// The fingerprint comes from a cheap probe over the data dictionary
/// (model/field counts plus the newest field `write_date`) rather than
/// hashing every model's schema.
#[derive(Clone)]
pub struct SchemaTracker {
    pool: ConnectionPool,
    state: Arc<Mutex<TrackerState>>,
    ttl: Duration,
}

impl SchemaTracker {
    pub fn new(pool: ConnectionPool, ttl: Duration) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(TrackerState {
                version: None,
                fields: HashMap::new(),
            })),
            ttl,
        }
    }

    async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> GatewayResult<Value> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.handler().execute_kw(model, method, args, kwargs).await;
        if matches!(
            result,
            Err(GatewayError::Network(_)) | Err(GatewayError::ConnectionFailed(_))
        ) {
            conn.mark_failed();
        }
        result
    }

    /// Current schema fingerprint, cached for the configured TTL.
    pub async fn version(&self) -> GatewayResult<String> {
        {
            let state = self.state.lock().expect("schema mutex poisoned");
            if let Some((version, at)) = &state.version
                && at.elapsed() < self.ttl
            {
                return Ok(version.clone());
            }
        }
        self.refresh_version().await
    }

    /// Force a fresh probe; callers use this to detect dictionary changes.
    pub async fn refresh_version(&self) -> GatewayResult<String> {
        let model_count = self
            .execute("ir.model", "search_count", json!([[]]), json!({}))
            .await?;
        let field_count = self
            .execute("ir.model.fields", "search_count", json!([[]]), json!({}))
            .await?;
        let newest = self
            .execute(
                "ir.model.fields",
                "search_read",
                json!([[]]),
                json!({"fields": ["write_date"], "order": "write_date desc", "limit": 1}),
            )
            .await?;

        let newest_stamp = newest
            .as_array()
            .and_then(|a| a.first())
            .and_then(|r| r.get("write_date"))
            .map(|v| v.to_string())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(format!("{model_count}:{field_count}:{newest_stamp}").as_bytes());
        let digest = hasher.finalize();
        let version: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

        let mut state = self.state.lock().expect("schema mutex poisoned");
        state.version = Some((version.clone(), Instant::now()));
        debug!(version = %version, "schema version refreshed");
        Ok(version)
    }

    /// Raw `fields_get` map for a model, cached per model.
    pub async fn fields_raw(&self, model: &str) -> GatewayResult<Value> {
        {
            let state = self.state.lock().expect("schema mutex poisoned");
            if let Some((value, at)) = state.fields.get(model)
                && at.elapsed() < self.ttl
            {
                return Ok(value.clone());
            }
        }

        let result = self
            .execute(
                model,
                "fields_get",
                json!([]),
                json!({"attributes": FIELD_ATTRIBUTES}),
            )
            .await?;

        if !result.is_object() {
            return Err(GatewayError::Protocol(format!(
                "fields_get for '{model}' did not return an object"
            )));
        }

        let mut state = self.state.lock().expect("schema mutex poisoned");
        state
            .fields
            .insert(model.to_string(), (result.clone(), Instant::now()));
        Ok(result)
    }

    pub async fn field_names(&self, model: &str) -> GatewayResult<Vec<String>> {
        let raw = self.fields_raw(model).await?;
        let Value::Object(map) = raw else {
            return Ok(Vec::new());
        };
        Ok(map.keys().cloned().collect())
    }

    /// Field defs in the flattened shape the schema tools serve.
    pub async fn field_defs(&self, model: &str) -> GatewayResult<Vec<FieldDef>> {
        let raw = self.fields_raw(model).await?;
        let Value::Object(map) = raw else {
            return Ok(Vec::new());
        };

        let mut defs: Vec<FieldDef> = map
            .iter()
            .map(|(name, info)| parse_field_def(name, info))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    /// Check that a field exists on the model; used by the picklist tool.
    pub async fn field_def(&self, model: &str, field: &str) -> GatewayResult<FieldDef> {
        let raw = self.fields_raw(model).await?;
        match raw.get(field) {
            Some(info) => Ok(parse_field_def(field, info)),
            None => Err(GatewayError::validation(
                ValidationKind::Field,
                format!("field '{field}' does not exist on model '{model}'"),
            )),
        }
    }

    /// Model names from `ir.model`. With `with_access` only models carrying
    /// at least one access rule are returned.
    pub async fn models(&self, with_access: bool) -> GatewayResult<Vec<String>> {
        let result = self
            .execute(
                "ir.model",
                "search_read",
                json!([[["transient", "=", false]]]),
                json!({"fields": ["model", "access_ids"], "order": "model"}),
            )
            .await?;

        let Some(records) = result.as_array() else {
            return Err(GatewayError::Protocol(
                "ir.model search_read did not return a list".to_string(),
            ));
        };

        let models = records
            .iter()
            .filter(|r| {
                if !with_access {
                    return true;
                }
                r.get("access_ids")
                    .and_then(|v| v.as_array())
                    .map(|a| !a.is_empty())
                    .unwrap_or(false)
            })
            .filter_map(|r| r.get("model").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect();
        Ok(models)
    }

    /// Drop the per-model field cache, e.g. after a version bump.
    pub fn clear_fields_cache(&self) {
        let mut state = self.state.lock().expect("schema mutex poisoned");
        state.fields.clear();
    }
}

fn parse_field_def(name: &str, info: &Value) -> FieldDef {
    let selection = info.get("selection").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|pair| {
                let items = pair.as_array()?;
                let key = items.first()?.as_str()?.to_string();
                let label = items.get(1)?.as_str().unwrap_or_default().to_string();
                Some((key, label))
            })
            .collect::<Vec<_>>()
    });

    FieldDef {
        name: name.to_string(),
        ttype: info
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("char")
            .to_string(),
        required: info.get("required").and_then(|v| v.as_bool()).unwrap_or(false),
        readonly: info.get("readonly").and_then(|v| v.as_bool()).unwrap_or(false),
        relation: info
            .get("relation")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        selection: selection.filter(|s| !s.is_empty()),
        store: info.get("store").and_then(|v| v.as_bool()).unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_def_basic() {
        let info = json!({
            "type": "char",
            "string": "Name",
            "required": true,
            "readonly": false
        });
        let def = parse_field_def("name", &info);
        assert_eq!(def.name, "name");
        assert_eq!(def.ttype, "char");
        assert!(def.required);
        assert!(!def.readonly);
        assert!(def.relation.is_none());
        assert!(def.store);
    }

    #[test]
    fn test_parse_field_def_many2one() {
        let info = json!({"type": "many2one", "relation": "res.country"});
        let def = parse_field_def("country_id", &info);
        assert_eq!(def.relation.as_deref(), Some("res.country"));
    }

    #[test]
    fn test_parse_field_def_selection() {
        let info = json!({
            "type": "selection",
            "selection": [["draft", "Draft"], ["sale", "Sales Order"]]
        });
        let def = parse_field_def("state", &info);
        let selection = def.selection.unwrap();
        assert_eq!(selection.len(), 2);
        assert_eq!(selection[0], ("draft".to_string(), "Draft".to_string()));
    }

    #[test]
    fn test_parse_field_def_odoo_false_values() {
        // Odoo serializes absent attributes as false.
        let info = json!({"type": "char", "relation": false, "selection": false});
        let def = parse_field_def("ref", &info);
        assert!(def.relation.is_none());
        assert!(def.selection.is_none());
    }
}
