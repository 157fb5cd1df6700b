use kv_plugin::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Plugin failed");
            eprintln!("Error: {e}");
            1
        }
    };

    // The stdin watcher may still be parked in a blocking read
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let config = Config::load()?;

    if let Err(e) = init_tracing(&config) {
        eprintln!("Warning: {e}");
    }

    tracing::info!(
        health_service = %config.plugin.health_service,
        transport = %config.endpoint.transport,
        backend = ?config.store.backend,
        "Starting kv-plugin"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_host(
        tokio::io::stdin(),
        shutdown.clone(),
        config.endpoint.liveness_poll(),
    ));
    tokio::spawn(watch_signals(shutdown.clone()));

    let store = store::from_config(&config.store);
    let mut server = PluginServer::new(config, HostEnv::from_env(), store);
    server.run(std::io::stdout(), shutdown).await?;

    tracing::info!("Plugin stopped gracefully");
    Ok(())
}
