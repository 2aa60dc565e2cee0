use orders_rpc::server::{BoundServer, RPCServer};
use orders_rpc::Result;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives the announcement made once the socket is bound.
pub trait StartupLog: Send + Sync {
    fn starting(&self, address: &str, local_addr: SocketAddr);
}

/// Announces startup through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStartupLog;

impl StartupLog for TracingStartupLog {
    fn starting(&self, address: &str, local_addr: SocketAddr) {
        tracing::info!(%local_addr, "Starting RPC server on {}", address);
    }
}

pub struct OrdersServer {
    addr: String,
    log: Arc<dyn StartupLog>,
}

impl OrdersServer {
    /// Stores `addr` as given. Nothing is validated until [`OrdersServer::run`].
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_log(addr, Arc::new(TracingStartupLog))
    }

    pub fn with_log(addr: impl Into<String>, log: Arc<dyn StartupLog>) -> Self {
        Self {
            addr: addr.into(),
            log,
        }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Binds the socket and announces it, without accepting yet.
    ///
    /// A bind failure is returned before anything is logged.
    pub async fn start(&self) -> Result<BoundServer> {
        let server = RPCServer::new();
        let bound = server.bind(&self.addr).await?;
        self.log.starting(&self.addr, bound.local_addr());
        Ok(bound)
    }

    /// Binds and serves until the runtime fails. Never returns `Ok`.
    pub async fn run(&self) -> Result<Infallible> {
        self.start().await?.serve().await
    }
}
