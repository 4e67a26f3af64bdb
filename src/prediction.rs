//! Prediction API client — polls a hosted model-inference service.
//!
//! The engine treats prediction payloads as pass-through: it never
//! shapes model parameters, it only reads lifecycle status and output.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::PredictionError;

/// Terminal prediction statuses as reported by the API.
const TERMINAL_STATUSES: &[&str] = &["succeeded", "failed", "canceled"];

/// A prediction record as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    /// Model output, typically a list of asset URLs.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Prediction {
    /// True once the API will not change this prediction again.
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(&self.status.as_str())
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

/// HTTP client for the prediction service.
pub struct PredictionClient {
    http: reqwest::Client,
    base_url: String,
    api_token: SecretString,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>, api_token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token,
        }
    }

    /// Fetch the current state of a prediction.
    pub async fn get_prediction(&self, id: &str) -> Result<Prediction, PredictionError> {
        let url = format!(
            "{}/predictions/{id}",
            self.base_url.trim_end_matches('/')
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| PredictionError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| PredictionError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        for status in ["succeeded", "failed", "canceled"] {
            let p = Prediction {
                id: "p1".to_string(),
                status: status.to_string(),
                output: None,
                error: None,
            };
            assert!(p.is_terminal(), "{status} should be terminal");
        }

        for status in ["starting", "processing", "queued"] {
            let p = Prediction {
                id: "p1".to_string(),
                status: status.to_string(),
                output: None,
                error: None,
            };
            assert!(!p.is_terminal(), "{status} should not be terminal");
        }
    }

    #[test]
    fn prediction_deserializes_with_optional_fields() {
        let p: Prediction =
            serde_json::from_str(r#"{"id": "p1", "status": "processing"}"#).unwrap();
        assert_eq!(p.id, "p1");
        assert!(p.output.is_none());
        assert!(p.error.is_none());
        assert!(!p.is_succeeded());
    }
}
