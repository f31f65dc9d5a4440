//! The varserver daemon.

use tracing::{error, info};

use varserver::{Config, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "bad configuration");
            std::process::exit(2);
        }
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "cannot bind listener");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!(%err, "server stopped");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }
}
