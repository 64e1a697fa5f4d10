use clap::Parser;
use rpckit_server::{CliArgs, ServerConfig, run_grpc_server_with_health, trap_signals};
use tokio_util::sync::CancellationToken;
use tonic_health::server::health_reporter;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let shutdown = CancellationToken::new();
    let signals = trap_signals(shutdown.clone());

    run_grpc_server_with_health(config, shutdown.clone(), |routes| {
        let (_reporter, health_service) = health_reporter();
        routes.add_service(health_service);
        Ok(())
    })
    .await?;

    shutdown.cancel();
    let _ = signals.await;
    Ok(())
}
