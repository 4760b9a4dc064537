//! Sentiment ensemble: an opaque primary classifier fused with the
//! deterministic lexicon fallback.
//!
//! Fusion: polarity = w * primary + (1-w) * fallback, same for confidence.
//! When the primary is unavailable the fallback scores alone with its
//! confidence scaled down (degraded mode).

use crate::metrics::PipelineMetrics;
use crate::pipeline::lexicon::LexiconScorer;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors from the primary classifier. All of them degrade the ensemble
/// instead of failing the item.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned malformed output: {0}")]
    Malformed(String),
}

/// Output of one classifier pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelScore {
    /// Polarity in [-1, 1]
    pub polarity: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// The opaque primary classifier. Implementations must be deterministic
/// for fixed weights and side-effect free.
#[async_trait]
pub trait SentimentModel: Send + Sync {
    async fn classify(&self, text: &str) -> Result<ModelScore, ModelError>;
    fn name(&self) -> &str;
}

/// Response row of a text-classification inference endpoint.
#[derive(Debug, Deserialize)]
struct InferenceLabel {
    label: String,
    score: f64,
}

/// HTTP client for a hosted transformer classifier. The model itself is a
/// black box; this only maps its label distribution onto a signed polarity.
pub struct HttpSentimentModel {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSentimentModel {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }

    fn map_labels(labels: &[InferenceLabel]) -> Result<ModelScore, ModelError> {
        let mut positive = 0.0;
        let mut negative = 0.0;
        for row in labels {
            match row.label.to_lowercase().as_str() {
                "positive" | "pos" | "bullish" => positive = row.score,
                "negative" | "neg" | "bearish" => negative = row.score,
                "neutral" => {}
                other => {
                    return Err(ModelError::Malformed(format!("unknown label: {}", other)));
                }
            }
        }
        let polarity = (positive - negative).clamp(-1.0, 1.0);
        // Probability mass on the signed labels; a mostly-neutral
        // distribution yields low confidence.
        let confidence = (positive + negative).clamp(0.0, 1.0);
        Ok(ModelScore {
            polarity,
            confidence,
        })
    }
}

#[async_trait]
impl SentimentModel for HttpSentimentModel {
    #[instrument(skip(self, text))]
    async fn classify(&self, text: &str) -> Result<ModelScore, ModelError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "inputs": text }))
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::Transport(format!(
                "inference endpoint returned {}",
                response.status()
            )));
        }

        let labels: Vec<InferenceLabel> = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        if labels.is_empty() {
            return Err(ModelError::Malformed("empty label set".to_string()));
        }
        Self::map_labels(&labels)
    }

    fn name(&self) -> &str {
        "http-transformer"
    }
}

/// One scored text, with the degraded flag for metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredText {
    pub polarity: f64,
    pub confidence: f64,
    pub degraded: bool,
}

/// Fuses the primary classifier with the lexicon fallback.
pub struct EnsembleScorer {
    primary: Option<Arc<dyn SentimentModel>>,
    lexicon: LexiconScorer,
    /// Fusion weight w of the primary
    primary_weight: f64,
    /// Confidence multiplier in degraded mode
    degraded_factor: f64,
    metrics: Arc<PipelineMetrics>,
}

impl EnsembleScorer {
    pub fn new(
        primary: Option<Arc<dyn SentimentModel>>,
        primary_weight: f64,
        degraded_factor: f64,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            primary,
            lexicon: LexiconScorer::new(),
            primary_weight: primary_weight.clamp(0.0, 1.0),
            degraded_factor: degraded_factor.clamp(0.0, 1.0),
            metrics,
        }
    }

    /// Score one text. Never fails: primary errors fall back to the
    /// lexicon in degraded mode.
    #[instrument(skip(self, text))]
    pub async fn score(&self, text: &str) -> ScoredText {
        let (fallback_polarity, fallback_confidence) = self.lexicon.score(text);

        let primary_result = match &self.primary {
            Some(model) => match model.classify(text).await {
                Ok(score) => Some(score),
                Err(e) => {
                    warn!("primary model {} unavailable: {}", model.name(), e);
                    None
                }
            },
            None => None,
        };

        match primary_result {
            Some(primary) => {
                let w = self.primary_weight;
                let polarity =
                    (w * primary.polarity + (1.0 - w) * fallback_polarity).clamp(-1.0, 1.0);
                let confidence =
                    (w * primary.confidence + (1.0 - w) * fallback_confidence).clamp(0.0, 1.0);
                debug!(
                    polarity,
                    confidence, "fused primary and fallback scores"
                );
                ScoredText {
                    polarity,
                    confidence,
                    degraded: false,
                }
            }
            None => {
                PipelineMetrics::inc(&self.metrics.scorer_degraded);
                ScoredText {
                    polarity: fallback_polarity.clamp(-1.0, 1.0),
                    confidence: (fallback_confidence * self.degraded_factor).clamp(0.0, 1.0),
                    degraded: true,
                }
            }
        }
    }
}
