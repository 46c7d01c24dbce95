#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::{
    config::{CliArgs, ServerConfig},
    serve,
    service::handler::CallScopeService,
    telemetry::init_telemetry,
};
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;

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

    let providers = init_telemetry()?;
    let service = CallScopeService::new(&config);

    let res = if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            log_startup_info(&uds_path, &config);
            let res = serve(
                service,
                UnixListenerStream::new(uds),
                config.shutdown_timeout,
                shutdown_signal(),
            )
            .await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp = TcpListener::bind(&config.server_addr).await?;
        log_startup_info(&config.server_addr, &config);
        serve(
            service,
            TcpListenerStream::new(tcp),
            config.shutdown_timeout,
            shutdown_signal(),
        )
        .await
    };

    providers.shutdown();
    res
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting callscope on {addr} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting callscope on {addr} (server stream burst {}, bidi burst {})",
            config.server_stream_burst,
            config.bidi_burst
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
