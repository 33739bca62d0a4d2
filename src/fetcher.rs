use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;

use crate::candidate::CandidateConfig;
use crate::error::FetchError;

const USER_AGENT: &str = concat!("vlessmux/", env!("VLESSMUX_BUILD_VERSION"));

/// Where remote candidates come from.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CandidateConfig>, FetchError>;
}

/// Fetches a newline-delimited list of Base64-encoded candidate documents
/// with a single GET. No caching, no retries.
#[derive(Debug, Clone)]
pub struct CandidateFetcher {
    url: Option<String>,
    timeout: Duration,
}

impl CandidateFetcher {
    #[must_use]
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    fn client(&self) -> Result<Client, FetchError> {
        Ok(Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .build()?)
    }
}

#[async_trait]
impl CandidateSource for CandidateFetcher {
    async fn fetch(&self) -> Result<Vec<CandidateConfig>, FetchError> {
        let url = self.url.as_deref().ok_or(FetchError::NotConfigured)?;
        let client = self.client()?;

        tracing::debug!(url = %url, "candidate_list_fetch");
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http(status));
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Err(FetchError::Empty);
        }

        let candidates = decode_candidate_list(&body);
        tracing::info!(count = candidates.len(), "candidate_list_fetched");
        Ok(candidates)
    }
}

/// Decode every non-blank line; bad lines are logged and skipped.
#[must_use]
pub fn decode_candidate_list(body: &str) -> Vec<CandidateConfig> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match decode_line(line.trim()) {
            Ok(cfg) => Some(cfg),
            Err(reason) => {
                tracing::warn!(line = idx + 1, reason = %reason, "candidate_line_skipped");
                None
            }
        })
        .collect()
}

fn decode_line(line: &str) -> Result<CandidateConfig, String> {
    let bytes = decode_base64_lenient(line).ok_or_else(|| "invalid base64".to_string())?;
    let text = String::from_utf8(bytes).map_err(|e| format!("invalid utf-8: {}", e))?;
    CandidateConfig::from_json(&text).map_err(|e| format!("invalid JSON document: {}", e))
}

fn decode_base64_lenient(input: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
}
