use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::{BridgeError, HttpClientConfig};

fn default_headers() -> HeaderMap {
    let mut default_headers = HeaderMap::new();

    default_headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate"),
    );

    default_headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );

    default_headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    default_headers
}

/// Build the HTTP client shared by every upstream request
pub fn create_client(config: &HttpClientConfig) -> Result<Client, BridgeError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .default_headers(default_headers())
        .cookie_store(true)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.pool_idle_timeout.is_zero() {
        client_builder = client_builder.pool_idle_timeout(config.pool_idle_timeout);
    }

    debug!(
        timeout = ?config.timeout,
        connect_timeout = ?config.connect_timeout,
        "Creating upstream HTTP client"
    );
    client_builder.build().map_err(BridgeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(create_client(&HttpClientConfig::default()).is_ok());

        let config = HttpClientConfig {
            follow_redirects: false,
            timeout: std::time::Duration::ZERO,
            ..Default::default()
        };
        assert!(create_client(&config).is_ok());
    }
}
