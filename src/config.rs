use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// RPC protocol used to talk to Odoo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcProtocol {
    #[default]
    Jsonrpc,
    Xmlrpc,
}

/// Client-facing transport the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    StreamableHttp,
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub streamable: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            streamable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Immutable gateway configuration, loaded once at startup and shared by
/// reference with every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub odoo_url: String,
    pub database: String,
    pub username: String,
    pub api_key: String,
    pub protocol: RpcProtocol,
    pub connection_type: TransportKind,

    pub pool_size: usize,
    /// Per-request timeout in seconds; also bounds pool acquisition.
    pub timeout: u64,
    pub retry_count: u32,
    pub base_retry_delay_ms: u64,
    pub connection_health_interval: u64,

    pub session_timeout_minutes: u64,
    pub session_cleanup_interval: u64,

    pub requests_per_minute: i64,
    pub rate_limit_max_wait_seconds: f64,

    pub cache_ttl: u64,
    pub cache_max_entries: usize,
    pub schema_cache_ttl: u64,

    pub max_payload_size: usize,
    pub max_fields_limit: usize,
    pub max_records_limit: i64,

    pub pii_masking: bool,
    /// Extra field names treated as PII on top of the built-in table.
    pub pii_fields: Vec<String>,
    pub audit_logging: bool,
    pub implicit_domains: bool,

    pub allowed_origins: Vec<String>,

    pub tls_version: Option<String>,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,

    pub sse_queue_maxsize: usize,

    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            odoo_url: String::new(),
            database: String::new(),
            username: String::new(),
            api_key: String::new(),
            protocol: RpcProtocol::default(),
            connection_type: TransportKind::default(),
            pool_size: 5,
            timeout: 30,
            retry_count: 3,
            base_retry_delay_ms: 250,
            connection_health_interval: 300,
            session_timeout_minutes: 60,
            session_cleanup_interval: 60,
            requests_per_minute: 120,
            rate_limit_max_wait_seconds: 0.0,
            cache_ttl: 300,
            cache_max_entries: 1024,
            schema_cache_ttl: 600,
            max_payload_size: 1024 * 1024,
            max_fields_limit: 100,
            max_records_limit: 200,
            pii_masking: false,
            pii_fields: Vec::new(),
            audit_logging: true,
            implicit_domains: true,
            allowed_origins: vec!["*".to_string()],
            tls_version: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            sse_queue_maxsize: 256,
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional JSON file, then apply environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("invalid config file: {e}")))
    }

    /// Environment variables win over file values; names follow the
    /// single-instance `ODOO_*` convention.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ODOO_URL") {
            self.odoo_url = v;
        }
        if let Ok(v) = std::env::var("ODOO_DB") {
            self.database = v;
        }
        if let Ok(v) = std::env::var("ODOO_USERNAME") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("ODOO_API_KEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("ODOO_PROTOCOL") {
            match v.trim().to_ascii_lowercase().as_str() {
                "xmlrpc" => self.protocol = RpcProtocol::Xmlrpc,
                "jsonrpc" => self.protocol = RpcProtocol::Jsonrpc,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("ODOO_POOL_SIZE")
            && let Ok(n) = v.parse()
        {
            self.pool_size = n;
        }
        if let Ok(v) = std::env::var("ODOO_TIMEOUT")
            && let Ok(n) = v.parse()
        {
            self.timeout = n;
        }
        if let Ok(v) = std::env::var("ODOO_REQUESTS_PER_MINUTE")
            && let Ok(n) = v.parse()
        {
            self.requests_per_minute = n;
        }

        self.odoo_url = normalize_url(&self.odoo_url);
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.odoo_url.trim().is_empty() {
            return Err(GatewayError::Config(
                "missing Odoo URL: set odoo_url in the config file or ODOO_URL".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(GatewayError::Config(
                "missing database: set database in the config file or ODOO_DB".to_string(),
            ));
        }
        if self.username.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "missing credentials: set username/api_key or ODOO_USERNAME/ODOO_API_KEY"
                    .to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(GatewayError::Config("pool_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    pub fn session_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval)
    }

    pub fn cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn schema_cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.connection_health_interval)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn rate_limit_max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_max_wait_seconds.max(0.0))
    }
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> GatewayConfig {
        GatewayConfig {
            odoo_url: "http://localhost:8069".to_string(),
            database: "test_db".to_string(),
            username: "admin".to_string(),
            api_key: "secret".to_string(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.pool_size, 5);
        assert_eq!(cfg.timeout, 30);
        assert_eq!(cfg.requests_per_minute, 120);
        assert_eq!(cfg.protocol, RpcProtocol::Jsonrpc);
        assert_eq!(cfg.connection_type, TransportKind::Stdio);
        assert!(cfg.implicit_domains);
    }

    #[test]
    fn test_validate_requires_url() {
        let mut cfg = minimal();
        cfg.odoo_url = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut cfg = minimal();
        cfg.api_key = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_ok() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_normalize_url_adds_scheme() {
        assert_eq!(normalize_url("localhost:8069"), "http://localhost:8069");
        assert_eq!(normalize_url("https://x.example"), "https://x.example");
        assert_eq!(normalize_url("  host  "), "http://host");
    }

    #[test]
    fn test_deserialize_partial_file() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{
                "odoo_url": "http://odoo:8069",
                "database": "prod",
                "username": "svc",
                "api_key": "k",
                "protocol": "xmlrpc",
                "connection_type": "streamable_http",
                "requests_per_minute": 60,
                "http": {"port": 9000}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.protocol, RpcProtocol::Xmlrpc);
        assert_eq!(cfg.connection_type, TransportKind::StreamableHttp);
        assert_eq!(cfg.requests_per_minute, 60);
        assert_eq!(cfg.http.port, 9000);
        // untouched keys keep defaults
        assert_eq!(cfg.pool_size, 5);
    }

    #[test]
    fn test_durations() {
        let cfg = minimal();
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.session_ttl(), Duration::from_secs(3600));
    }
}
