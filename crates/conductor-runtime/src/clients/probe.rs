//! HTTP health probe.

use async_trait::async_trait;
use std::time::Duration;

use super::{ClientError, HttpProbe};

/// Timeout applied to every probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`HttpProbe`] over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    http: reqwest::Client,
}

impl ReqwestProbe {
    /// Create a probe with the default timeout.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Create a probe with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get_status(&self, url: &str) -> Result<u16, ClientError> {
        let response = self.http.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let probe = ReqwestProbe::with_timeout(Duration::from_millis(200)).unwrap();
        assert!(probe.get_status("http://127.0.0.1:9/docs").await.is_err());
    }
}
