use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::config::ServerConfig;

/// Idle connections kept per host in each worker's pool.
const POOL_MAX_IDLE_PER_HOST: usize = 32;
/// Idle connection timeout. Long streams should not tear the pool down.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Build one worker's HTTP session.
///
/// Each worker owns its own client (and therefore its own connection pool)
/// so a worker stuck reading a large streamed response cannot head-of-line
/// block another worker's dispatches. No client-level timeout is set; the
/// per-request deadline is enforced in the lifecycle engine where the
/// failure can be classified.
pub fn build_client(config: &ServerConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &config.api_key {
        let mut value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("server.api_key contains invalid header characters")?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .default_headers(headers);

    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let cert_pem = std::fs::read(cert)
            .with_context(|| format!("failed to read client cert {}", cert.display()))?;
        let key_pem = std::fs::read(key)
            .with_context(|| format!("failed to read client key {}", key.display()))?;
        let mut identity_pem = cert_pem;
        identity_pem.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .context("failed to build mTLS identity from cert/key")?;
        builder = builder.identity(identity);
    }

    builder.build().context("failed to build HTTP client")
}

/// Endpoint path for the configured API flavor.
pub fn endpoint_url(base_url: &str, api_type: crate::config::ApiType) -> String {
    let base = base_url.trim_end_matches('/');
    match api_type {
        crate::config::ApiType::Completion => format!("{base}/v1/completions"),
        crate::config::ApiType::Chat => format!("{base}/v1/chat/completions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;

    #[test]
    fn endpoint_urls() {
        assert_eq!(
            endpoint_url("http://localhost:8000", ApiType::Completion),
            "http://localhost:8000/v1/completions"
        );
        assert_eq!(
            endpoint_url("http://localhost:8000/", ApiType::Chat),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn client_builds_without_tls_material() {
        let config = ServerConfig::for_tests("http://localhost:8000");
        assert!(build_client(&config).is_ok());
    }
}
