use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::PlayerError;

pub const DEFAULT_USER_AGENT: &str = concat!("stitch-engine/", env!("CARGO_PKG_VERSION"));

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client shared by the resolver and the segment fetcher.
pub fn build_client(config: &ResolverConfig) -> Result<reqwest::Client, PlayerError> {
    install_rustls_provider();

    reqwest::Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| {
            warn!(error = %e, "Failed to build HTTP client");
            PlayerError::configuration(format!("failed to build HTTP client: {e}"))
        })
}
