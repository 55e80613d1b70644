use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::handler::OdooRpc;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// One pooled handler with its bookkeeping.
struct PooledHandler {
    handler: Arc<dyn OdooRpc>,
    last_used: Instant,
    failures: u32,
}

struct PoolInner {
    config: Arc<GatewayConfig>,
    /// Bounds total live handlers to `pool_size`.
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PooledHandler>>,
    live: AtomicUsize,
}

/// Bounded pool of Odoo RPC handlers.
///
/// Handlers are created lazily up to `pool_size`; `acquire` waits up to the
/// request timeout for a slot. The returned guard gives the slot back on
/// drop, so every acquire has a matching release on every exit path.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
}

impl ConnectionPool {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let size = config.pool_size;
        Self {
            inner: Arc::new(PoolInner {
                config,
                semaphore: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a handler. Waits up to the configured timeout for a free slot,
    /// reusing an idle handler when one exists and constructing a new one
    /// otherwise.
    pub async fn acquire(&self) -> GatewayResult<PooledConnection> {
        let timeout = self.inner.config.request_timeout();
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| GatewayError::PoolTimeout(timeout))?
        .map_err(|_| GatewayError::Internal("connection pool is closed".to_string()))?;

        let existing = {
            let mut idle = self.inner.idle.lock().expect("pool mutex poisoned");
            idle.pop()
        };

        let pooled = match existing {
            Some(p) => p,
            None => {
                let handler = self.build_handler().await?;
                self.inner.live.fetch_add(1, Ordering::SeqCst);
                PooledHandler {
                    handler,
                    last_used: Instant::now(),
                    failures: 0,
                }
            }
        };

        Ok(PooledConnection {
            pooled: Some(pooled),
            pool: Arc::clone(&self.inner),
            _permit: permit,
            failed: false,
        })
    }

    /// Construct a handler with retries and exponential backoff.
    async fn build_handler(&self) -> GatewayResult<Arc<dyn OdooRpc>> {
        let cfg = &self.inner.config;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=cfg.retry_count {
            match super::build_handler(cfg) {
                Ok(handler) => return Ok(handler),
                Err(e) => {
                    last_err = Some(e);
                }
            }
            if attempt < cfg.retry_count {
                let backoff = cfg.base_retry_delay().saturating_mul(1 << attempt.min(8));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(match last_err {
            Some(GatewayError::Config(msg)) => GatewayError::Config(msg),
            Some(e) => GatewayError::ConnectionFailed(e.to_string()),
            None => GatewayError::ConnectionFailed("handler construction failed".to_string()),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().expect("pool mutex poisoned").len();
        let live = self.inner.live.load(Ordering::SeqCst);
        PoolStats {
            size: self.inner.config.pool_size,
            idle,
            in_use: live.saturating_sub(idle),
        }
    }

    /// True once the pool holds at least one connection that answered a
    /// cheap probe; builds and probes one if none exist yet.
    pub async fn ensure_healthy(&self) -> bool {
        match self.acquire().await {
            Ok(conn) => {
                let ok = conn
                    .handler()
                    .call("common", "version", json!([]))
                    .await
                    .is_ok();
                let mut conn = conn;
                if !ok {
                    conn.mark_failed();
                }
                ok
            }
            Err(_) => false,
        }
    }

    /// Background probe: idle handlers older than the health interval get a
    /// cheap `common.version` call; failures are destroyed and replaced
    /// lazily.
    pub fn spawn_health_probe(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = pool.inner.config.health_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.probe_idle(interval).await;
            }
        })
    }

    async fn probe_idle(&self, older_than: Duration) {
        let stale: Vec<PooledHandler> = {
            let mut idle = self.inner.idle.lock().expect("pool mutex poisoned");
            let now = Instant::now();
            let (old, fresh): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|p| now.duration_since(p.last_used) >= older_than);
            *idle = fresh;
            old
        };

        for mut pooled in stale {
            match pooled.handler.call("common", "version", json!([])).await {
                Ok(_) => {
                    pooled.last_used = Instant::now();
                    pooled.failures = 0;
                    let mut idle = self.inner.idle.lock().expect("pool mutex poisoned");
                    idle.push(pooled);
                }
                Err(e) => {
                    warn!(error = %e, "health probe failed, destroying connection");
                    self.inner.live.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Guard over an acquired handler. Dropping it releases the slot; a failed
/// handler past the retry budget is destroyed instead of returned.
pub struct PooledConnection {
    pooled: Option<PooledHandler>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    failed: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn handler(&self) -> Arc<dyn OdooRpc> {
        Arc::clone(
            &self
                .pooled
                .as_ref()
                .expect("pooled handler taken before drop")
                .handler,
        )
    }

    /// Record a failure on this connection; repeated failures destroy it.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };
        pooled.last_used = Instant::now();

        if self.failed {
            pooled.failures += 1;
            if pooled.failures > self.pool.config.retry_count {
                debug!("discarding connection past its failure budget");
                self.pool.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        } else {
            pooled.failures = 0;
        }

        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(pooled);
        }
    }
}
