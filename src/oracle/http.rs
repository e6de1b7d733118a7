//! Oracle served over HTTP.
//!
//! Calls `POST {base_url}/evaluate` with an [`OracleRequest`] body and
//! expects an [`OracleOutput`] JSON response.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{timeout_from_secs, Oracle, OracleOutput, OracleRequest};
use crate::error::OracleError;
use crate::structure::Configuration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOracleConfig {
    pub base_url: String,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HttpOracle {
    base_url: String,
    parameters: serde_json::Value,
    timeout_secs: Option<f64>,
    http: reqwest::Client,
}

impl HttpOracle {
    pub fn new(config: HttpOracleConfig) -> Result<Self, OracleError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(timeout_from_secs(secs)?);
        }
        let http = builder
            .build()
            .map_err(|e| OracleError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            parameters: config.parameters,
            timeout_secs: config.timeout_secs,
            http,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/evaluate", self.base_url)
    }
}

impl Oracle for HttpOracle {
    async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
        let url = self.endpoint();
        debug!(%url, step = configuration.step_index, "sending oracle request");

        let body = OracleRequest::new(configuration, &self.parameters);
        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            match (e.is_timeout(), self.timeout_secs) {
                (true, Some(secs)) => OracleError::Timeout { secs },
                _ => OracleError::Transport(e.to_string()),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(OracleError::Process {
                status: status.to_string(),
                stderr: text,
            });
        }

        let output: OracleOutput = resp
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        output.validate(configuration.len())
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
