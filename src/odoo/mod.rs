pub mod handler;
pub mod jsonrpc;
pub mod pool;
pub mod xmlrpc;

use std::sync::Arc;

pub use handler::OdooRpc;

use crate::config::{GatewayConfig, RpcProtocol};
use crate::error::GatewayResult;

/// Construct an RPC handler for the configured protocol.
pub fn build_handler(cfg: &GatewayConfig) -> GatewayResult<Arc<dyn OdooRpc>> {
    match cfg.protocol {
        RpcProtocol::Jsonrpc => Ok(Arc::new(jsonrpc::OdooJsonRpc::new(cfg)?)),
        RpcProtocol::Xmlrpc => Ok(Arc::new(xmlrpc::OdooXmlRpc::new(cfg)?)),
    }
}
