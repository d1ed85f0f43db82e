//! Text-to-speech synthesis with per-campaign memoization.
//!
//! `get_audio` resolves a text to a playable audio handle. Hits are
//! served from a two-level map `campaign -> text -> handle`; misses
//! call the external TTS service (multipart field `text`, bounded
//! request timeout) outside any lock. The cache for a campaign is
//! wiped whenever its post-call menu is persisted.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::CampaignId;

/// Bound on one synthesis request
const TTS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TtsResponse {
    filename: String,
}

/// Synthesis client plus memo
pub struct TtsEngine {
    client: reqwest::Client,
    endpoint: String,
    cache: Mutex<HashMap<CampaignId, HashMap<String, String>>>,
}

impl TtsEngine {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TTS_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::tts(format!("building TTS client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve `text` to an audio handle for `campaign_id`.
    ///
    /// Failure is terminal for the current playback attempt; callers
    /// must not retry inside the same attempt.
    pub async fn get_audio(&self, campaign_id: CampaignId, text: &str) -> Result<String> {
        if let Some(handle) = self.cached(campaign_id, text) {
            debug!("TTS cache hit for campaign {}", campaign_id);
            return Ok(handle);
        }

        let handle = self.synthesize(text).await?;
        self.cache
            .lock()
            .entry(campaign_id)
            .or_default()
            .insert(text.to_string(), handle.clone());
        Ok(handle)
    }

    /// Wipe the memo for one campaign (menu was re-saved)
    pub fn invalidate(&self, campaign_id: CampaignId) {
        if self.cache.lock().remove(&campaign_id).is_some() {
            info!("🧹 TTS cache invalidated for campaign {}", campaign_id);
        }
    }

    fn cached(&self, campaign_id: CampaignId, text: &str) -> Option<String> {
        self.cache
            .lock()
            .get(&campaign_id)
            .and_then(|texts| texts.get(text))
            .cloned()
    }

    async fn synthesize(&self, text: &str) -> Result<String> {
        let form = reqwest::multipart::Form::new().text("text", text.to_string());
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| EngineError::tts(format!("TTS request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::tts(format!(
                "TTS service returned {}",
                response.status()
            )));
        }

        let parsed: TtsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::tts(format!("TTS response malformed: {}", e)))?;

        Ok(strip_gsm_suffix(&parsed.filename).to_string())
    }

    #[cfg(test)]
    fn insert_cached(&self, campaign_id: CampaignId, text: &str, handle: &str) {
        self.cache
            .lock()
            .entry(campaign_id)
            .or_default()
            .insert(text.to_string(), handle.to_string());
    }
}

/// The service reports `<name>.gsm`; playback wants the bare handle
fn strip_gsm_suffix(filename: &str) -> &str {
    filename.strip_suffix(".gsm").unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_gsm_only() {
        assert_eq!(strip_gsm_suffix("greeting-42.gsm"), "greeting-42");
        assert_eq!(strip_gsm_suffix("greeting-42"), "greeting-42");
        assert_eq!(strip_gsm_suffix("nested.gsm.gsm"), "nested.gsm");
    }

    #[tokio::test]
    async fn cache_hit_skips_synthesis() {
        // Endpoint is unreachable: a hit must not touch the network
        let engine = TtsEngine::new("http://127.0.0.1:1/tts".to_string()).unwrap();
        engine.insert_cached(5, "hello", "audio-5");
        let handle = engine.get_audio(5, "hello").await.unwrap();
        assert_eq!(handle, "audio-5");
    }

    #[tokio::test]
    async fn invalidate_clears_one_campaign_only() {
        let engine = TtsEngine::new("http://127.0.0.1:1/tts".to_string()).unwrap();
        engine.insert_cached(1, "a", "audio-a");
        engine.insert_cached(2, "b", "audio-b");

        engine.invalidate(1);

        assert!(engine.cached(1, "a").is_none());
        assert_eq!(engine.cached(2, "b").as_deref(), Some("audio-b"));
    }

    #[tokio::test]
    async fn miss_with_unreachable_service_is_terminal() {
        let engine = TtsEngine::new("http://127.0.0.1:1/tts".to_string()).unwrap();
        let err = engine.get_audio(9, "hola").await.unwrap_err();
        assert!(matches!(err, EngineError::Tts(_)));
    }
}
