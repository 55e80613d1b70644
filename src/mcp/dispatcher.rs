use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::SubscriptionBus;
use crate::cache::{CacheKey, ResponseCache, is_cacheable};
use crate::config::GatewayConfig;
use crate::domain::DomainContext;
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::normalize::canonical_arguments;
use crate::mcp::registry::{Registry, ToolKind, validate_arguments};
use crate::mcp::{prompts, protocol, resources, tools};
use crate::odoo::pool::{ConnectionPool, PoolStats};
use crate::schema::SchemaTracker;
use crate::security::audit::{AuditLog, arg_digest};
use crate::security::implicit::ImplicitDomains;
use crate::security::pii::PiiMasker;
use crate::security::rate_limit::RateLimiter;
use crate::session::{Authenticator, SessionStore};

/// How long an `operation_id` replay window stays open.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

const PROTOCOL_VERSION_DEFAULT: &str = "2025-06-18";

/// Per-connection identity handed in by the transport.
#[derive(Clone)]
pub struct ClientContext {
    /// Bus identity; subscriptions die with it on disconnect.
    pub client_id: u64,
    /// Rate-limit fallback key: remote address or transport constant.
    pub key: String,
    /// Bounded sink for server-pushed notifications, when the transport
    /// supports one.
    pub sink: Option<mpsc::Sender<Value>>,
}

impl ClientContext {
    pub fn new(client_id: u64, key: impl Into<String>, sink: Option<mpsc::Sender<Value>>) -> Self {
        Self {
            client_id,
            key: key.into(),
            sink,
        }
    }
}

/// Everything a tool handler needs to know about the caller.
pub struct Invocation {
    /// Effective uid: the session's user, or the gateway's global user.
    pub uid: i64,
    /// True when the effective uid is the gateway's own global user.
    /// Unprivileged callers only ever see (and cache) masked PII.
    pub privileged: bool,
    pub domain_ctx: DomainContext,
}

struct IdemEntry {
    result: Value,
    at: Instant,
}

/// The MCP method router. Owns the registry, cache, rate limiter,
/// subscription bus and security components, and holds the pool handle
/// every Odoo call goes through.
pub struct Dispatcher {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) pool: ConnectionPool,
    pub(crate) sessions: SessionStore,
    pub(crate) authenticator: Authenticator,
    pub(crate) rate: RateLimiter,
    pub(crate) cache: ResponseCache,
    pub(crate) schema: SchemaTracker,
    pub(crate) registry: Registry,
    pub(crate) bus: SubscriptionBus,
    pub(crate) pii: PiiMasker,
    pub(crate) implicit: ImplicitDomains,
    pub(crate) audit: AuditLog,
    idempotency: Mutex<HashMap<String, IdemEntry>>,
    global_uid: tokio::sync::Mutex<Option<i64>>,
    company_ids: Mutex<HashMap<i64, Vec<i64>>>,
}

impl Dispatcher {
    pub fn new(config: Arc<GatewayConfig>) -> GatewayResult<Self> {
        let pool = ConnectionPool::new(Arc::clone(&config));
        let sessions = SessionStore::new(config.session_ttl());
        let authenticator = Authenticator::new(
            pool.clone(),
            sessions.clone(),
            config.database.clone(),
        );
        let rate = RateLimiter::new(config.requests_per_minute, config.rate_limit_max_wait());
        let cache = ResponseCache::new(config.cache_ttl_duration(), config.cache_max_entries);
        let schema = SchemaTracker::new(pool.clone(), config.schema_cache_ttl_duration());
        let registry = Registry::builtin()?;
        let bus = SubscriptionBus::new(config.sse_queue_maxsize);
        let pii = PiiMasker::new(config.pii_masking, &config.pii_fields);
        let implicit = ImplicitDomains::new(config.implicit_domains);
        let audit = AuditLog::new(config.audit_logging);

        Ok(Self {
            config,
            pool,
            sessions,
            authenticator,
            rate,
            cache,
            schema,
            registry,
            bus,
            pii,
            implicit,
            audit,
            idempotency: Mutex::new(HashMap::new()),
            global_uid: tokio::sync::Mutex::new(None),
            company_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn bus(&self) -> &SubscriptionBus {
        &self.bus
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    pub async fn healthy(&self) -> bool {
        self.pool.ensure_healthy().await
    }

    /// Launch the background sweepers (sessions, pool health).
    pub fn start_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.sessions.spawn_sweeper(self.config.session_cleanup_period()),
            self.pool.spawn_health_probe(),
        ]
    }

    /// Entry point for transports: one raw JSON value in, at most one
    /// response out. Notifications (no id) are processed but never
    /// answered.
    pub async fn handle_message(&self, raw: Value, client: &ClientContext) -> Option<Value> {
        let message = match protocol::parse_message(&raw) {
            Ok(m) => m,
            Err(e) => {
                let id = raw.get("id").cloned().filter(|v| !v.is_null());
                return Some(protocol::error_response(id, &e));
            }
        };

        match message.id {
            None => {
                if let Err(e) = self
                    .handle_method(&message.method, message.params, client)
                    .await
                {
                    debug!(method = %message.method, error = %e, "notification failed");
                }
                None
            }
            Some(id) => {
                match self
                    .handle_method(&message.method, message.params, client)
                    .await
                {
                    Ok(result) => Some(protocol::success_response(id, result)),
                    Err(e) => Some(protocol::error_response(Some(id), &e)),
                }
            }
        }
    }

    /// MCP method router. Spec snake names and the slash-style aliases
    /// MCP clients actually send are both accepted.
    pub async fn handle_method(
        &self,
        method: &str,
        params: Option<Value>,
        client: &ClientContext,
    ) -> GatewayResult<Value> {
        match method {
            "initialize" => Ok(self.initialize_result(params)),
            "initialized" | "notifications/initialized" => Ok(json!({})),
            "ping" => Ok(json!({})),
            "list_tools" | "tools/list" => Ok(json!({ "tools": self.registry.list_tools() })),
            "call_tool" | "tools/call" => self.call_tool(params, client).await,
            "list_resource_templates" | "resources/templates/list" => Ok(json!({
                "resourceTemplates": self.registry.list_resource_templates()
            })),
            "read_resource" | "resources/read" => {
                let uri = required_uri(&params)?;
                let inv = self.invocation(None).await?;
                resources::read(self, &uri, &inv).await
            }
            "subscribe_resource" | "resources/subscribe" => {
                let uri = required_uri(&params)?;
                resources::parse_uri(&uri)?;
                if let Some(sink) = &client.sink {
                    self.bus.subscribe(&uri, client.client_id, sink.clone());
                }
                Ok(json!({ "ok": true }))
            }
            "unsubscribe_resource" | "resources/unsubscribe" => {
                let uri = required_uri(&params)?;
                self.bus.unsubscribe(&uri, client.client_id);
                Ok(json!({ "ok": true }))
            }
            "list_prompts" | "prompts/list" => {
                Ok(prompts::list_prompts_result(self.registry.list_prompts()))
            }
            "get_prompt" | "prompts/get" => {
                let params =
                    params.ok_or_else(|| GatewayError::InvalidParams("missing params".into()))?;
                let name = params
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::InvalidParams("missing prompt name".into()))?;
                let prompt = self
                    .registry
                    .get_prompt(name)
                    .ok_or_else(|| GatewayError::McpMethodNotFound(format!("unknown prompt: {name}")))?;
                Ok(prompts::get_prompt_result(prompt))
            }
            other => Err(GatewayError::McpMethodNotFound(other.to_string())),
        }
    }

    fn initialize_result(&self, params: Option<Value>) -> Value {
        let protocol_version = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or(PROTOCOL_VERSION_DEFAULT)
            .to_string();

        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": true, "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": "odoo-mcp-gateway",
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Tools bridge to an Odoo backend; start with odoo.schema.models, validate domains with odoo.domain.validate, and subscribe to odoo://{model}/{id} resources for change notifications."
        })
    }

    /// The `call_tool` pipeline: normalize, schema-validate, resolve the
    /// session, take a rate token, execute, audit.
    async fn call_tool(&self, params: Option<Value>, client: &ClientContext) -> GatewayResult<Value> {
        let params =
            params.ok_or_else(|| GatewayError::InvalidParams("missing params".to_string()))?;
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidParams("call_tool requires 'name'".to_string()))?
            .to_string();

        let tool = self
            .registry
            .get(&name)
            .ok_or_else(|| GatewayError::Tool(format!("unknown tool: {name}")))?;
        let kind = tool.kind;

        let (arguments, envelope_warnings) = canonical_arguments(&params);
        for warning in &envelope_warnings {
            debug!(tool = %name, warning = %warning, "argument envelope normalized");
        }

        validate_arguments(&tool.input_schema, &Value::Object(arguments.clone()))
            .map_err(|errors| GatewayError::InvalidParams(errors.join("; ")))?;

        // A session id authorizes the call and selects the effective uid;
        // destroy_session must accept expired ids, so it skips resolution.
        let session_id = arguments
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let session_uid = match &session_id {
            Some(id) if kind != ToolKind::DestroySession => Some(self.sessions.resolve(id)?),
            _ => None,
        };

        let rate_key = session_id.unwrap_or_else(|| client.key.clone());
        self.rate.acquire(&rate_key).await?;

        let started = Instant::now();
        let digest = arg_digest(&Value::Object(arguments.clone()));
        let model = arguments
            .get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let result = tools::dispatch_tool(self, kind, &arguments, session_uid, client).await;

        match &result {
            Ok(value) => self.audit.success(
                &client.key,
                &name,
                model.as_deref(),
                None,
                &digest,
                &summarize(value),
                started.elapsed(),
            ),
            Err(e) => self.audit.failure(
                &client.key,
                &name,
                model.as_deref(),
                None,
                &digest,
                e.kind(),
                e.code(),
                started.elapsed(),
            ),
        }

        result
    }

    /// Build the invocation context: effective uid, privilege, and the
    /// placeholder resolution data. Privilege is decided against the
    /// global uid, so a session that happens to resolve to the gateway's
    /// own user shares its cache entries consistently.
    pub(crate) async fn invocation(&self, session_uid: Option<i64>) -> GatewayResult<Invocation> {
        let global_uid = self.global_uid().await?;
        let (uid, privileged) = match session_uid {
            Some(uid) => (uid, uid == global_uid),
            None => (global_uid, true),
        };
        let company_ids = self.company_ids_for(uid).await;
        Ok(Invocation {
            uid,
            privileged,
            domain_ctx: DomainContext::new(uid, company_ids),
        })
    }

    async fn global_uid(&self) -> GatewayResult<i64> {
        let mut cached = self.global_uid.lock().await;
        if let Some(uid) = *cached {
            return Ok(uid);
        }
        let mut conn = self.pool.acquire().await?;
        let result = conn
            .handler()
            .authenticate(
                &self.config.database,
                &self.config.username,
                &self.config.api_key,
            )
            .await;
        match result {
            Ok(uid) => {
                *cached = Some(uid);
                Ok(uid)
            }
            Err(e) => {
                if matches!(e, GatewayError::Network(_) | GatewayError::ConnectionFailed(_)) {
                    conn.mark_failed();
                }
                Err(e)
            }
        }
    }

    /// Allowed company ids for a user, fetched once and kept. Failure
    /// degrades to "no companies known", which skips the implicit company
    /// filter.
    async fn company_ids_for(&self, uid: i64) -> Vec<i64> {
        {
            let cache = self.company_ids.lock().expect("company cache poisoned");
            if let Some(ids) = cache.get(&uid) {
                return ids.clone();
            }
        }

        let result = self
            .pool_execute(
                "res.users",
                "read",
                json!([[uid], ["company_ids"]]),
                json!({}),
            )
            .await;

        let ids: Vec<i64> = match result {
            Ok(records) => records
                .as_array()
                .and_then(|a| a.first())
                .and_then(|r| r.get("company_ids"))
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default(),
            Err(e) => {
                warn!(uid, error = %e, "could not resolve company ids");
                Vec::new()
            }
        };

        let mut cache = self.company_ids.lock().expect("company cache poisoned");
        cache.insert(uid, ids.clone());
        ids
    }

    /// One `execute_kw` through the pool, with connection failure
    /// accounting.
    pub(crate) async fn pool_execute(
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

    /// Read path: served from cache when possible. Entries are keyed by
    /// effective uid; a privileged caller caches the un-masked form while
    /// unprivileged callers are masked before insertion, so a cache hit
    /// always returns exactly what that identity is allowed to see.
    pub(crate) async fn execute_read(
        &self,
        inv: &Invocation,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> GatewayResult<Value> {
        if !is_cacheable(method) {
            let mut result = self.pool_execute(model, method, args, kwargs).await?;
            if !inv.privileged {
                self.pii.mask(&mut result);
            }
            return Ok(result);
        }

        let version = self
            .schema
            .version()
            .await
            .unwrap_or_else(|_| "unversioned".to_string());
        let key = CacheKey::new(
            &self.config.database,
            inv.uid,
            model,
            method,
            &args,
            &kwargs,
            &version,
        );

        if let Some(hit) = self.cache.get(&key) {
            debug!(model = %model, method = %method, "cache hit");
            return Ok(hit);
        }

        let mut result = self.pool_execute(model, method, args, kwargs).await?;
        if !inv.privileged {
            self.pii.mask(&mut result);
        }
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    /// Write path: bypasses the cache and drops the model's cached reads.
    /// Write and action results can carry record-shaped data, so they go
    /// through the same masking rule as reads.
    pub(crate) async fn execute_write(
        &self,
        inv: &Invocation,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> GatewayResult<Value> {
        let mut result = self.pool_execute(model, method, args, kwargs).await?;
        self.cache.invalidate_model(&self.config.database, model);
        if !inv.privileged {
            self.pii.mask(&mut result);
        }
        Ok(result)
    }

    /// Field names for a model, degraded to empty on introspection
    /// failure (implicit filters are then skipped with a warning).
    pub(crate) async fn model_field_names(&self, model: &str) -> Vec<String> {
        match self.schema.field_names(model).await {
            Ok(names) => names,
            Err(e) => {
                warn!(model = %model, error = %e, "field introspection failed; implicit domains skipped");
                Vec::new()
            }
        }
    }

    /// Publish resource updates for written records. Called before the
    /// success response is sent, so subscribers observe the invalidation
    /// first.
    pub(crate) fn publish_record_update(&self, model: &str, ids: &[i64]) {
        for id in ids {
            self.bus
                .publish_resource_updated(&format!("odoo://{model}/{id}"));
        }
        self.bus
            .publish_resource_updated(&format!("odoo://{model}/list"));
    }

    /// Idempotent replay: a write carrying an `operation_id` seen inside
    /// the window returns its recorded result without re-executing.
    pub(crate) fn idempotent_replay(&self, operation_id: Option<&str>) -> Option<Value> {
        let op = operation_id?;
        let store = self.idempotency.lock().expect("idempotency mutex poisoned");
        store
            .get(op)
            .filter(|e| e.at.elapsed() < IDEMPOTENCY_WINDOW)
            .map(|e| e.result.clone())
    }

    pub(crate) fn idempotent_record(&self, operation_id: Option<&str>, result: &Value) {
        let Some(op) = operation_id else { return };
        let mut store = self.idempotency.lock().expect("idempotency mutex poisoned");
        store.retain(|_, e| e.at.elapsed() < IDEMPOTENCY_WINDOW);
        store.insert(
            op.to_string(),
            IdemEntry {
                result: result.clone(),
                at: Instant::now(),
            },
        );
    }
}

fn required_uri(params: &Option<Value>) -> GatewayResult<String> {
    params
        .as_ref()
        .and_then(|p| p.get("uri"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::InvalidParams("missing 'uri'".to_string()))
}

fn summarize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            if let Some(records) = map.get("records").and_then(|v| v.as_array()) {
                format!("{} records", records.len())
            } else if let Some(id) = map.get("id") {
                format!("id={id}")
            } else {
                format!("{} keys", map.len())
            }
        }
        Value::Array(items) => format!("{} items", items.len()),
        other => other.to_string(),
    }
}
