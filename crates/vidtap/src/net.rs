// HTTP client construction for active fetches.

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::NetConfig;
use crate::error::SessionError;

/// Baseline request headers for active fetches. Media CDNs commonly gate
/// segment URLs on browser-looking requests.
///
/// `Accept-Encoding` is deliberately not set here: reqwest adds it (and
/// transparently decompresses) when the compression features are enabled, as
/// long as the header is not overridden.
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("*/*"),
    );

    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );

    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );

    headers
}

/// Build the shared per-session HTTP client.
///
/// Custom headers from the config are merged over the defaults and take
/// precedence for the same fields.
pub fn create_client(config: &NetConfig) -> Result<Client, SessionError> {
    let mut headers = default_headers();
    for (name, value) in config.headers.iter() {
        headers.insert(name.clone(), value.clone());
    }

    let client = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .build()?;

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_do_not_override_encoding() {
        let headers = default_headers();
        assert!(headers.get(reqwest::header::ACCEPT_ENCODING).is_none());
        assert!(headers.get(reqwest::header::ACCEPT).is_some());
    }

    #[test]
    fn test_create_client_with_custom_headers() {
        let mut config = NetConfig::default();
        config.headers.insert(
            reqwest::header::REFERER,
            HeaderValue::from_static("https://player.example.com/"),
        );
        assert!(create_client(&config).is_ok());
    }
}
