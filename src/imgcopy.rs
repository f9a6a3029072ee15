use std::sync::Arc;

use image_copy::config::Config;
use image_copy::{copy_image, CredentialBroker, TransportContext, TrustPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(CredentialBroker::new(config.credential_provider()?));
    let context = TransportContext::new(broker)
        .with_client_config_source(&config)
        .with_daemon_socket(config.daemon_socket.clone());

    // Trust policies are not loaded from disk; the tool copies whatever it is
    // pointed at.
    let policy = TrustPolicy::accept_anything();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling copy");
            on_interrupt.cancel();
        }
    });

    info!(source = %config.source, destination = %config.destination, "starting copy");
    let result = copy_image(
        &config.source,
        &config.destination,
        &policy,
        &config.copy_options(),
        &context,
        cancel,
    )
    .await?;

    println!("{}", result.manifest_digest);
    Ok(())
}
