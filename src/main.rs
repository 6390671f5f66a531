//! ras - remote access shell server
//!
//! Listens for TCP clients, gives each one a shell-like session with its own
//! environment, and runs the pipelines they type on the server. Sessions can
//! talk to each other with `tell`, `yell`, `name` and `who`, and pass output
//! between users with `>N` / `<N`.
//!
//! Configuration comes from the TOML file named by `$RAS_CONFIG`, if any.
//! The positional PORT argument overrides the configured port.

use std::sync::Arc;

use clap::Parser;
use ras::config::ServerConfig;
use ras::server::{self, ServerError};
use ras::session::SessionRegistry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ras - remote access shell server
#[derive(Parser, Debug)]
#[command(name = "ras", version, about, long_about = None)]
struct Cli {
    /// Port to listen on (overrides the config file)
    port: Option<u16>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ras=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ServerConfig::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let listener = server::bind(&config).await?;
    let registry = SessionRegistry::from_config(&config);
    let cancel = CancellationToken::new();

    let mut server_handle = tokio::spawn(server::serve(
        listener,
        config.clone(),
        registry,
        cancel.clone(),
    ));

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut server_handle => {
            flatten(result)?;
            false
        }
    };
    if interrupted {
        tracing::info!("received Ctrl+C, shutting down");
        cancel.cancel();
        flatten(server_handle.await)?;
    }

    tracing::info!("server stopped");
    Ok(())
}

fn flatten(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    match result {
        Ok(inner) => Ok(inner?),
        Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
    }
}
