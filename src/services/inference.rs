use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::emotion::EmotionScores;

/// The pluggable emotion-classification capability: JPEG frames in, one
/// score distribution per frame out.
pub trait EmotionClassifier {
    fn classify_batch(
        &self,
        jpeg_frames: &[Vec<u8>],
    ) -> impl std::future::Future<Output = Result<Vec<EmotionScores>, InferenceError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed inference response: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct ClassifyRequest {
    frames: Vec<String>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    predictions: Vec<EmotionScores>,
}

/// HTTP client for the emotion inference service.
pub struct HttpEmotionClassifier {
    http: Client,
    base_url: String,
}

impl HttpEmotionClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

impl EmotionClassifier for HttpEmotionClassifier {
    async fn classify_batch(
        &self,
        jpeg_frames: &[Vec<u8>],
    ) -> Result<Vec<EmotionScores>, InferenceError> {
        let url = format!("{}/classify", self.base_url);
        let request = ClassifyRequest {
            frames: jpeg_frames
                .iter()
                .map(|f| base64::engine::general_purpose::STANDARD.encode(f))
                .collect(),
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        if parsed.predictions.len() != jpeg_frames.len() {
            return Err(InferenceError::Malformed(format!(
                "sent {} frames, got {} predictions",
                jpeg_frames.len(),
                parsed.predictions.len()
            )));
        }
        for scores in &parsed.predictions {
            if scores.values().any(|s| !(0.0..=1.0).contains(s)) {
                return Err(InferenceError::Malformed(
                    "confidence score outside [0,1]".to_string(),
                ));
            }
        }

        Ok(parsed.predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::emotion::EmotionLabel;

    #[test]
    fn classify_response_parses_labelled_scores() {
        let body = r#"{"predictions":[{"happy":0.9,"neutral":0.1},{"sad":0.6,"fear":0.3}]}"#;
        let parsed: ClassifyResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.predictions.len(), 2);
        assert!((parsed.predictions[0][&EmotionLabel::Happy] - 0.9).abs() < 1e-9);
        assert!((parsed.predictions[1][&EmotionLabel::Fear] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn unknown_labels_are_rejected() {
        let body = r#"{"predictions":[{"ecstatic":1.0}]}"#;
        assert!(serde_json::from_str::<ClassifyResponse>(body).is_err());
    }
}
