use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use url::Url;

use super::handler::OdooRpc;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult, classify_odoo_fault};

/// Odoo JSON-RPC handler against the `/jsonrpc` endpoint.
///
/// Uses a keep-alive HTTP client with the configured TLS options. Faults
/// surfaced in the JSON-RPC `error` member are normalized through
/// `classify_odoo_fault`; transport failures and HTTP status >= 400 map to
/// `Network`.
pub struct OdooJsonRpc {
    endpoint: Url,
    db: String,
    username: String,
    api_key: String,
    http: reqwest::Client,
    max_retries: u32,
    base_retry_delay: Duration,
    /// Cached uid after the first successful authenticate.
    uid: RwLock<Option<i64>>,
}

impl OdooJsonRpc {
    pub fn new(cfg: &GatewayConfig) -> GatewayResult<Self> {
        let mut base_url = Url::parse(&cfg.odoo_url)
            .map_err(|e| GatewayError::Config(format!("invalid Odoo url '{}': {e}", cfg.odoo_url)))?;
        base_url.set_path("/jsonrpc");
        base_url.set_query(None);
        base_url.set_fragment(None);

        let http = build_http_client(cfg)?;

        Ok(Self {
            endpoint: base_url,
            db: cfg.database.clone(),
            username: cfg.username.clone(),
            api_key: cfg.api_key.clone(),
            http,
            max_retries: cfg.retry_count,
            base_retry_delay: cfg.base_retry_delay(),
            uid: RwLock::new(None),
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("odoo-mcp-gateway/0.1"));
        headers
    }

    fn build_request(&self, service: &str, method: &str, args: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args
            },
            "id": 1
        })
    }

    /// Send one JSON-RPC call, retrying transport errors and 5xx/429 with
    /// exponential backoff.
    async fn rpc(&self, service: &str, method: &str, args: Value) -> GatewayResult<Value> {
        let body = self.build_request(service, method, args);
        let headers = self.headers();

        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            let resp = self
                .http
                .post(self.endpoint.clone())
                .headers(headers.clone())
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();

                    if status.is_success() {
                        let v: Value = serde_json::from_str(&text).map_err(|e| {
                            GatewayError::Protocol(format!(
                                "failed to parse JSON-RPC response: {e}"
                            ))
                        })?;

                        if let Some(error) = v.get("error") {
                            let message = error
                                .get("data")
                                .and_then(|d| d.get("message"))
                                .and_then(|m| m.as_str())
                                .or_else(|| error.get("message").and_then(|m| m.as_str()))
                                .unwrap_or("unknown JSON-RPC error");
                            return Err(classify_odoo_fault(message));
                        }

                        if let Some(result) = v.get("result") {
                            return Ok(result.clone());
                        }

                        return Err(GatewayError::Protocol(
                            "JSON-RPC response missing 'result' field".to_string(),
                        ));
                    }

                    let err =
                        GatewayError::Network(format!("Odoo returned HTTP {}", status.as_u16()));
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_err = Some(err);
                    } else {
                        return Err(err);
                    }
                }
                Err(e) => {
                    last_err = Some(GatewayError::Network(e.to_string()));
                }
            }

            if attempt < self.max_retries {
                let backoff = self.base_retry_delay.saturating_mul(1 << attempt.min(8));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| GatewayError::Network("request failed without details".to_string())))
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
impl OdooRpc for OdooJsonRpc {
    async fn authenticate(&self, db: &str, login: &str, secret: &str) -> GatewayResult<i64> {
        let args = json!([db, login, secret, {}]);
        let result = self.rpc("common", "authenticate", args).await?;

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

        // execute_kw always takes [db, uid, secret, model, method, args, kwargs];
        // kwargs must be an object even when empty.
        let kwargs = if kwargs.is_object() { kwargs } else { json!({}) };
        let call_args = json!([self.db, uid, self.api_key, model, method, args, kwargs]);

        let result = self.rpc("object", "execute_kw", call_args).await;
        if let Err(GatewayError::Auth(_)) = &result {
            // Stale uid: force a fresh authenticate on the next call.
            let mut cached = self.uid.write().await;
            *cached = None;
        }
        result
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> GatewayResult<Value> {
        self.rpc(service, method, args).await
    }
}

/// Keep-alive client honoring the TLS options from the config: minimum TLS
/// version, optional CA bundle, optional client certificate + key.
fn build_http_client(cfg: &GatewayConfig) -> GatewayResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(cfg.request_timeout())
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(version) = &cfg.tls_version {
        let min = match version.trim() {
            "1.2" | "TLSv1.2" => reqwest::tls::Version::TLS_1_2,
            "1.3" | "TLSv1.3" => reqwest::tls::Version::TLS_1_3,
            other => {
                return Err(GatewayError::Config(format!(
                    "unsupported tls_version '{other}': expected 1.2 or 1.3"
                )));
            }
        };
        builder = builder.min_tls_version(min);
    }

    if let Some(ca_path) = &cfg.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .map_err(|e| GatewayError::Config(format!("cannot read ca_cert_path: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| GatewayError::Config(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert_path), Some(key_path)) = (&cfg.client_cert_path, &cfg.client_key_path) {
        let mut pem = std::fs::read(cert_path)
            .map_err(|e| GatewayError::Config(format!("cannot read client_cert_path: {e}")))?;
        let key = std::fs::read(key_path)
            .map_err(|e| GatewayError::Config(format!("cannot read client_key_path: {e}")))?;
        pem.extend_from_slice(&key);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| GatewayError::Config(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))
}
