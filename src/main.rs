//! mailhub daemon entry point.

use mailhub::api;
use mailhub::store::SqliteStore;
use mailhub::{Config, Mailhub};

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mailhub")]
#[command(about = "Remote mailbox connectivity layer for webmail")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "mailhub.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailhub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&cli.config)?;
    tracing::info!(
        config = %cli.config.display(),
        accounts = config.accounts.len(),
        "starting mailhub"
    );

    let store = SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open cache database {}", config.database.url))?;
    let mailhub = Mailhub::from_config(&config, store);
    mailhub.start();

    let shutdown = CancellationToken::new();
    let server = api::serve(mailhub.clone(), &config.server, shutdown.clone());
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            mailhub.shutdown().await;
            return result;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested");
        }
    }

    // Stop accepting first, then close client sockets so upgraded connections end.
    shutdown.cancel();
    mailhub.shutdown().await;
    server.await
}
