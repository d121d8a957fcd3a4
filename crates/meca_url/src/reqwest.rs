use meca_config::Config;
use meca_consts::consts;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};

/// Builds the HTTP client used to probe and download bundles.
///
/// No retry middleware is installed, retrying failed probes or downloads is
/// left to the caller.
pub fn build_reqwest_client(config: &Config) -> reqwest::Result<ClientWithMiddleware> {
    if config.tls_no_verify() {
        tracing::warn!(
            "TLS verification is disabled. This is insecure and should only be used for testing or internal networks."
        );
    }

    let client = Client::builder()
        .user_agent(consts::USER_AGENT)
        .danger_accept_invalid_certs(config.tls_no_verify())
        .read_timeout(config.download_timeout())
        .build()?;

    Ok(ClientBuilder::new(client).build())
}
