use orders_rpc::server::RPCServer;
use tokio::task::JoinHandle;

/// A small payload, roughly the size of an order lookup request
pub fn generate_small_payload() -> Vec<u8> {
    b"order-7f3a9c1e-2b44-4d0a-9e61-0c2b7a5d8f10".to_vec()
}

/// ~5KB payload
pub fn generate_medium_payload() -> Vec<u8> {
    (0..5120).map(|i| (i % 256) as u8).collect()
}

/// Server handle for managing server lifecycle
pub struct ServerHandle {
    handle: JoinHandle<()>,
    address: String,
}

impl ServerHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Binds `server` on an ephemeral loopback port and serves it in the background
pub async fn setup_server(
    server: RPCServer,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let bound = server.bind("127.0.0.1:0").await?;
    let address = bound.local_addr().to_string();

    let handle = tokio::spawn(async move {
        if let Err(e) = bound.serve().await {
            eprintln!("Accept error: {}", e);
        }
    });

    Ok(ServerHandle { handle, address })
}
