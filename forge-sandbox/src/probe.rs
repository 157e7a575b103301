//! HTTP liveness probe

use std::time::Duration;
use tracing::trace;

/// Answers whether an endpoint is serving HTTP
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HealthProbe {
    pub fn new(path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            client,
            path: path.into(),
        }
    }

    /// Full probe URL for an endpoint
    pub fn url(&self, endpoint: &str) -> String {
        let path = self.path.trim_start_matches('/');
        format!("{}/{path}", endpoint.trim_end_matches('/'))
    }

    /// True when the endpoint answers with anything but a 5xx
    pub async fn check(&self, endpoint: &str) -> bool {
        let url = self.url(endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                trace!(url = %url, error = %e, "liveness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url() {
        let probe = HealthProbe::new("/health");
        assert_eq!(probe.url("http://127.0.0.1:4100"), "http://127.0.0.1:4100/health");
        assert_eq!(HealthProbe::new("/").url("http://127.0.0.1:4100/"), "http://127.0.0.1:4100/");
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!HealthProbe::new("/").check(&format!("http://127.0.0.1:{port}")).await);
    }
}
