use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use url::Url;

use super::handler::OdooRpc;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult, classify_odoo_fault};

/// Odoo XML-RPC handler against `/xmlrpc/2/{common,object}`.
///
/// The wire client is blocking, so every call runs on a blocking worker and
/// is bounded by the per-request timeout; the async caller only awaits the
/// join handle. Faults are normalized into the common taxonomy exactly like
/// the JSON-RPC variant.
pub struct OdooXmlRpc {
    base_url: Url,
    db: String,
    username: String,
    api_key: String,
    timeout: Duration,
    uid: RwLock<Option<i64>>,
}

impl OdooXmlRpc {
    pub fn new(cfg: &GatewayConfig) -> GatewayResult<Self> {
        let mut base_url = Url::parse(&cfg.odoo_url)
            .map_err(|e| GatewayError::Config(format!("invalid Odoo url '{}': {e}", cfg.odoo_url)))?;
        base_url.set_path("");
        base_url.set_query(None);
        base_url.set_fragment(None);

        Ok(Self {
            base_url,
            db: cfg.database.clone(),
            username: cfg.username.clone(),
            api_key: cfg.api_key.clone(),
            timeout: cfg.request_timeout(),
            uid: RwLock::new(None),
        })
    }

    fn service_endpoint(&self, service: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/xmlrpc/2/{service}"));
        url.to_string()
    }

    /// Run one XML-RPC call on a blocking worker, bounded by the request
    /// timeout.
    async fn rpc(
        &self,
        service: &str,
        method: &str,
        args: Vec<xmlrpc::Value>,
    ) -> GatewayResult<Value> {
        let url = self.service_endpoint(service);
        let method = method.to_string();

        let handle = tokio::task::spawn_blocking(move || {
            let mut request = xmlrpc::Request::new(&method);
            for arg in args {
                request = request.arg(arg);
            }
            request.call_url(url.as_str())
        });

        let joined = tokio::time::timeout(self.timeout, handle)
            .await
            .map_err(|_| GatewayError::Network("XML-RPC request timed out".to_string()))?
            .map_err(|e| GatewayError::Internal(format!("XML-RPC worker failed: {e}")))?;

        match joined {
            Ok(value) => Ok(xml_to_json(value)),
            Err(err) => {
                if let Some(fault) = err.fault() {
                    Err(classify_odoo_fault(&fault.fault_string))
                } else {
                    Err(GatewayError::Network(err.to_string()))
                }
            }
        }
    }

    async fn ensure_uid(&self) -> GatewayResult<i64> {
        {
            let cached = self.uid.read().await;
            if let Some(uid) = *cached {
                return Ok(uid);
            }
        }
        self.authenticate(&self.db, &self.username, &self.api_key)
            .await
    }
}

#[async_trait]
impl OdooRpc for OdooXmlRpc {
    async fn authenticate(&self, db: &str, login: &str, secret: &str) -> GatewayResult<i64> {
        let args = vec![
            xmlrpc::Value::String(db.to_string()),
            xmlrpc::Value::String(login.to_string()),
            xmlrpc::Value::String(secret.to_string()),
            xmlrpc::Value::Struct(BTreeMap::new()),
        ];
        let result = self.rpc("common", "authenticate", args).await?;

        // Odoo answers `false` for bad credentials.
        let uid = result.as_i64().unwrap_or(0);
        if uid <= 0 {
            return Err(GatewayError::Auth(format!(
                "authentication failed for user '{login}'"
            )));
        }

        if login == self.username && db == self.db {
            let mut cached = self.uid.write().await;
            *cached = Some(uid);
        }
        Ok(uid)
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> GatewayResult<Value> {
        let uid = self.ensure_uid().await?;
        let kwargs = if kwargs.is_object() { kwargs } else { json!({}) };

        let wire_args = vec![
            xmlrpc::Value::String(self.db.clone()),
            xmlrpc::Value::Int64(uid),
            xmlrpc::Value::String(self.api_key.clone()),
            xmlrpc::Value::String(model.to_string()),
            xmlrpc::Value::String(method.to_string()),
            json_to_xml(&args),
            json_to_xml(&kwargs),
        ];

        let result = self.rpc("object", "execute_kw", wire_args).await;
        if let Err(GatewayError::Auth(_)) = &result {
            let mut cached = self.uid.write().await;
            *cached = None;
        }
        result
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> GatewayResult<Value> {
        let wire_args = match &args {
            Value::Array(items) => items.iter().map(json_to_xml).collect(),
            Value::Null => Vec::new(),
            other => vec![json_to_xml(other)],
        };
        self.rpc(service, method, wire_args).await
    }
}

/// Bridge a JSON value onto the XML-RPC value model.
pub fn json_to_xml(v: &Value) -> xmlrpc::Value {
    match v {
        Value::Null => xmlrpc::Value::Nil,
        Value::Bool(b) => xmlrpc::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    xmlrpc::Value::Int(i as i32)
                } else {
                    xmlrpc::Value::Int64(i)
                }
            } else {
                xmlrpc::Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => xmlrpc::Value::String(s.clone()),
        Value::Array(items) => xmlrpc::Value::Array(items.iter().map(json_to_xml).collect()),
        Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, vv) in map {
                out.insert(k.clone(), json_to_xml(vv));
            }
            xmlrpc::Value::Struct(out)
        }
    }
}

/// Bridge an XML-RPC value back into JSON.
pub fn xml_to_json(v: xmlrpc::Value) -> Value {
    match v {
        xmlrpc::Value::Nil => Value::Null,
        xmlrpc::Value::Bool(b) => Value::Bool(b),
        xmlrpc::Value::Int(i) => json!(i),
        xmlrpc::Value::Int64(i) => json!(i),
        xmlrpc::Value::Double(d) => json!(d),
        xmlrpc::Value::String(s) => Value::String(s),
        xmlrpc::Value::DateTime(dt) => Value::String(format!("{dt:?}")),
        xmlrpc::Value::Base64(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        xmlrpc::Value::Array(items) => Value::Array(items.into_iter().map(xml_to_json).collect()),
        xmlrpc::Value::Struct(map) => {
            let mut out = Map::new();
            for (k, vv) in map {
                out.insert(k, xml_to_json(vv));
            }
            Value::Object(out)
        }
    }
}
