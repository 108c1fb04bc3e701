//! Provider executable: prints the handshake line and serves gRPC until the
//! host stops it.

use hemmer_provider_alicloud::{init_logging, serve, AlicloudProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting alicloud provider");
    serve(AlicloudProvider::new()).await
}
