use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayResult;

/// One interface over both Odoo RPC protocol variants.
///
/// `authenticate` exchanges credentials for a numeric uid via the `common`
/// service; `execute_kw` invokes `object.execute_kw` with the handler's
/// cached global uid; `call` is the generic fall-through for other service
/// methods (`common.version` is the pool's health probe).
#[async_trait]
pub trait OdooRpc: Send + Sync {
    async fn authenticate(&self, db: &str, login: &str, secret: &str) -> GatewayResult<i64>;

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> GatewayResult<Value>;

    async fn call(&self, service: &str, method: &str, args: Value) -> GatewayResult<Value>;
}
