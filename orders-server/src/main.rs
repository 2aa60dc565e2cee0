use clap::Parser;
use orders_rpc::Error;
use orders_server::cli::Args;
use orders_server::OrdersServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let server = OrdersServer::new(args.addr);
    match server.run().await {
        Ok(never) => match never {},
        Err(e @ Error::BindFailed { .. }) => {
            tracing::error!("Failed to listen: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("RPC server stopped: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
