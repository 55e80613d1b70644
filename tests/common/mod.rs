//! Common test utilities: a mock Odoo JSON-RPC server and gateway
//! construction helpers.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{method as http_method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use odoo_mcp_gateway::config::GatewayConfig;
use odoo_mcp_gateway::mcp::{ClientContext, Dispatcher};

/// Matches a JSON-RPC call to a given Odoo service/method pair.
pub struct ServiceMethod {
    service: String,
    method: String,
}

impl ServiceMethod {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl Match for ServiceMethod {
    fn matches(&self, request: &Request) -> bool {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return false;
        };
        body["params"]["service"] == json!(self.service)
            && body["params"]["method"] == json!(self.method)
    }
}

/// Matches `common.authenticate` for one specific login, so tests can
/// hand different uids to the gateway's global user and session users.
pub struct AuthenticateLogin {
    login: String,
}

impl AuthenticateLogin {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
        }
    }
}

impl Match for AuthenticateLogin {
    fn matches(&self, request: &Request) -> bool {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return false;
        };
        body["params"]["service"] == json!("common")
            && body["params"]["method"] == json!("authenticate")
            && body["params"]["args"][1] == json!(self.login)
    }
}

/// Matches an `execute_kw` call for a given model + ORM method, wherever
/// they sit inside the positional argument list.
pub struct ExecuteKw {
    model: String,
    method: String,
}

impl ExecuteKw {
    pub fn new(model: &str, method: &str) -> Self {
        Self {
            model: model.to_string(),
            method: method.to_string(),
        }
    }
}

impl Match for ExecuteKw {
    fn matches(&self, request: &Request) -> bool {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return false;
        };
        if body["params"]["service"] != json!("object")
            || body["params"]["method"] != json!("execute_kw")
        {
            return false;
        }
        let args = &body["params"]["args"];
        args[3] == json!(self.model) && args[4] == json!(self.method)
    }
}

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": result
    }))
}

fn rpc_fault(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {
            "code": 200,
            "message": "Odoo Server Error",
            "data": {
                "name": "odoo.exceptions.Error",
                "message": message
            }
        }
    }))
}

/// Mock Odoo server answering on `/jsonrpc`.
pub struct MockOdoo {
    pub server: MockServer,
}

impl MockOdoo {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub async fn mock_authenticate(&self, uid: i64) {
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(ServiceMethod::new("common", "authenticate"))
            .respond_with(rpc_result(json!(uid)))
            .mount(&self.server)
            .await;
    }

    /// Per-login authenticate: lets the global user and a session user
    /// resolve to different uids within one test.
    pub async fn mock_authenticate_user(&self, login: &str, uid: i64) {
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(AuthenticateLogin::new(login))
            .respond_with(rpc_result(json!(uid)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_authenticate_rejected(&self) {
        // Odoo answers `false` for bad credentials.
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(ServiceMethod::new("common", "authenticate"))
            .respond_with(rpc_result(json!(false)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_version(&self) {
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(ServiceMethod::new("common", "version"))
            .respond_with(rpc_result(json!({"server_version": "19.0"})))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_execute(&self, model: &str, odoo_method: &str, result: Value) {
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(ExecuteKw::new(model, odoo_method))
            .respond_with(rpc_result(result))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_execute_fault(&self, model: &str, odoo_method: &str, message: &str) {
        Mock::given(http_method("POST"))
            .and(path("/jsonrpc"))
            .and(ExecuteKw::new(model, odoo_method))
            .respond_with(rpc_fault(message))
            .mount(&self.server)
            .await;
    }

    /// All `execute_kw` bodies received for one model/method pair.
    pub async fn execute_kw_requests(&self, model: &str, odoo_method: &str) -> Vec<Value> {
        let matcher = ExecuteKw::new(model, odoo_method);
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| matcher.matches(r))
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }
}

/// Gateway config pointed at the mock server, with fast failure paths and
/// the security layers off unless a test opts in.
pub fn test_config(odoo_url: &str) -> GatewayConfig {
    GatewayConfig {
        odoo_url: odoo_url.to_string(),
        database: "test_db".to_string(),
        username: "admin".to_string(),
        api_key: "test_api_key".to_string(),
        timeout: 5,
        retry_count: 0,
        base_retry_delay_ms: 1,
        requests_per_minute: 0,
        implicit_domains: false,
        pii_masking: false,
        audit_logging: false,
        ..GatewayConfig::default()
    }
}

pub fn dispatcher(config: GatewayConfig) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(Arc::new(config)).expect("dispatcher construction"))
}

pub fn test_client(d: &Dispatcher) -> ClientContext {
    ClientContext::new(d.bus().register_client(), "test-client", None)
}

/// Run one `call_tool` request through the dispatcher and return the full
/// JSON-RPC response.
pub async fn call_tool(d: &Dispatcher, client: &ClientContext, name: &str, arguments: Value) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "call_tool",
        "params": { "name": name, "arguments": arguments }
    });
    d.handle_message(request, client)
        .await
        .expect("call_tool requests always get a response")
}
