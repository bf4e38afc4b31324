//! HTTP result channel.
//!
//! The workload serves two files from the instance: a status file whose body
//! contains [`COMPLETION_MARKER`] once the run is done, and the result
//! archive.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::HarvestConfig;
use crate::core::{HarvestError, LiveInstance, ProviderError, ResultChannel};

/// Text the status file carries once the workload is done.
pub const COMPLETION_MARKER: &str = "EXPERIMENT_COMPLETED";

const STATUS_PATH: &str = "experiment_status.txt";
const RESULT_PATH: &str = "result.tar.gz";

/// Polls `http://<address>:<port>/` for completion and results.
#[derive(Debug, Clone)]
pub struct HttpResultChannel {
    client: reqwest::Client,
    port: u16,
}

impl HttpResultChannel {
    /// Build a channel with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// [`HarvestError::Provider`] if the HTTP client cannot be built.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, HarvestError> {
        // Each worker drives requests from its own runtime; pooled connections
        // would be bound to whichever runtime opened them.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client, port })
    }

    /// Channel configured from `config`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_config(config: &HarvestConfig) -> Result<Self, HarvestError> {
        Self::new(config.result_port, config.http_timeout())
    }

    fn url(&self, instance: &LiveInstance, path: &str) -> Result<String, ProviderError> {
        let address = instance.address.as_deref().ok_or_else(|| {
            ProviderError::NotFound(format!("{} has no address", instance.handle.id))
        })?;
        Ok(format!("http://{address}:{}/{path}", self.port))
    }
}

fn transport(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl ResultChannel for HttpResultChannel {
    async fn poll_completion(&self, instance: &LiveInstance) -> Result<bool, ProviderError> {
        let url = self.url(instance, STATUS_PATH)?;
        let response = self.client.get(&url).send().await.map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            debug!(%url, status = %response.status(), "status file not available yet");
            return Ok(false);
        }
        let body = response.text().await.map_err(|e| transport(&e))?;
        Ok(body.contains(COMPLETION_MARKER))
    }

    async fn fetch_result(&self, instance: &LiveInstance) -> Result<Vec<u8>, ProviderError> {
        let url = self.url(instance, RESULT_PATH)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| transport(&e))?;
        let bytes = response.bytes().await.map_err(|e| transport(&e))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InstanceHandle, ResourceClass};

    fn live(address: Option<&str>) -> LiveInstance {
        LiveInstance {
            handle: InstanceHandle {
                id: "i-0abc".into(),
                instance_type: "c5.large".into(),
                class: ResourceClass::Spot,
            },
            address: address.map(str::to_owned),
        }
    }

    #[test]
    fn test_url_uses_address_and_port() {
        let channel = HttpResultChannel::new(8080, Duration::from_secs(1)).unwrap();
        let url = channel.url(&live(Some("10.0.0.7")), STATUS_PATH).unwrap();
        assert_eq!(url, "http://10.0.0.7:8080/experiment_status.txt");
    }

    #[tokio::test]
    async fn test_missing_address_is_not_found() {
        let channel = HttpResultChannel::new(8080, Duration::from_secs(1)).unwrap();
        let err = channel.poll_completion(&live(None)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }
}
