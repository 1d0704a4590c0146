//! HTTP client for the controller's worker API.

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;

use crate::api::{Work, WorkResultReport};

#[derive(Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base: String,
}

impl ControllerClient {
    pub fn new(controller_uri: &str) -> Result<Self> {
        Ok(ControllerClient {
            http: reqwest::Client::builder()
                // Work responses carry whole source tarballs; generous, but
                // still bounded.
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .context("failed to build HTTP client")?,
            base: controller_uri.trim_end_matches('/').to_string(),
        })
    }

    pub async fn heartbeat(&self, hostname: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/v1/worker/heartbeat/{hostname}", self.base))
            .send()
            .await
            .context("failed to send heartbeat to controller")?;
        if response.status() != StatusCode::NO_CONTENT {
            bail!("controller answered heartbeat with status {}", response.status());
        }
        Ok(())
    }

    pub async fn request_work(&self, amount: u32) -> Result<Vec<Work>> {
        let response = self
            .http
            .get(format!(
                "{}/api/v1/worker/requestWork?amount={amount}",
                self.base
            ))
            .send()
            .await
            .context("failed to request work from controller")?;
        if response.status() != StatusCode::OK {
            bail!("controller answered work request with status {}", response.status());
        }
        response
            .json()
            .await
            .context("controller sent a malformed work list")
    }

    pub async fn report_work_result(&self, report: &WorkResultReport) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/api/v1/worker/reportWorkResult", self.base))
            .json(report)
            .send()
            .await
            .context("failed to report work result to controller")?;
        if response.status() != StatusCode::NO_CONTENT {
            bail!(
                "controller answered work result with status {}",
                response.status()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalized() {
        let client = ControllerClient::new("http://ctrl:8080/").unwrap();
        assert_eq!(client.base, "http://ctrl:8080");
        let client = ControllerClient::new("http://ctrl:8080").unwrap();
        assert_eq!(client.base, "http://ctrl:8080");
    }
}
