use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;

/// End-to-end check that traffic really leaves through the local proxy.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn check(&self, local_proxy_port: u16) -> bool;
}

#[derive(Debug, Clone)]
pub struct ConnectionValidator {
    test_url: String,
    timeout: Duration,
}

impl ConnectionValidator {
    #[must_use]
    pub fn new(test_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_url: test_url.into(),
            timeout,
        }
    }

    /// One GET to `test_url` through `socks5h://127.0.0.1:<port>`.
    /// Any failure, including a non-2xx status, is `false`.
    pub async fn check_via(&self, local_proxy_port: u16) -> bool {
        let client = match build_proxied_client(local_proxy_port, self.timeout) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "validator_client_build_failed");
                return false;
            }
        };

        let outcome = client.get(&self.test_url).send().await;
        // The client owns the only pool; dropping it closes every socket
        // whatever the outcome was.
        let ok = match outcome {
            Ok(resp) => {
                let status = resp.status();
                tracing::debug!(status = %status, url = %self.test_url, "validator_response");
                status.is_success()
            }
            Err(e) => {
                tracing::debug!(error = %e, url = %self.test_url, "validator_request_failed");
                false
            }
        };
        drop(client);
        ok
    }
}

#[async_trait]
impl ConnectivityCheck for ConnectionValidator {
    async fn check(&self, local_proxy_port: u16) -> bool {
        self.check_via(local_proxy_port).await
    }
}

fn build_proxied_client(port: u16, timeout: Duration) -> anyhow::Result<Client> {
    let proxy_url = format!("socks5h://127.0.0.1:{}", port);
    let proxy = reqwest::Proxy::all(&proxy_url)
        .with_context(|| format!("invalid proxy URL {}", proxy_url))?;
    Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_max_idle_per_host(0)
        .build()
        .context("failed to build HTTP client")
}
