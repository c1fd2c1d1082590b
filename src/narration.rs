use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ElevenLabsConfig;
use crate::db::Database;
use crate::models::{AudioObject, VoiceSettings, new_id};
use crate::storage::ObjectStore;

pub const AUDIO_MIME_TYPE: &str = "audio/mpeg";

/// Represents a voice from ElevenLabs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub preview_url: Option<String>,
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    voices: Vec<Voice>,
}

pub struct ElevenLabsClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    pub fn new(config: &ElevenLabsConfig) -> Self {
        Self {
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn voices(&self) -> Result<Vec<Voice>> {
        let url = format!("{}/voices", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .context("Failed to send request to ElevenLabs API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("ElevenLabs API error ({}): {}", status, error_text);
        }

        let voices_response: VoicesResponse = response
            .json()
            .await
            .context("Failed to parse ElevenLabs voices response")?;

        Ok(voices_response.voices)
    }

    /// Returns MP3 bytes.
    pub async fn text_to_speech(
        &self,
        voice_id: &str,
        text: &str,
        model_id: &str,
        settings: VoiceSettings,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/text-to-speech/{}", self.base_url, voice_id);

        let body = serde_json::json!({
            "text": text,
            "model_id": model_id,
            "voice_settings": settings,
        });

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", AUDIO_MIME_TYPE)
            .json(&body)
            .send()
            .await
            .context("Failed to send text-to-speech request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("ElevenLabs TTS error ({}): {}", status, error_text);
        }

        let audio_bytes = response
            .bytes()
            .await
            .context("Failed to read audio response")?
            .to_vec();

        Ok(audio_bytes)
    }
}

#[derive(Debug, Clone)]
pub struct NarrationRequest {
    pub text: String,
    pub owner_id: String,
    pub message_id: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    pub settings: VoiceSettings,
}

/// Turns narration text into a stored audio object and returns its URL.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &NarrationRequest) -> Result<String>;

    async fn voices(&self) -> Result<Vec<Voice>>;
}

pub struct NarrationSynthesizer {
    client: ElevenLabsClient,
    store: Arc<dyn ObjectStore>,
    db: Database,
    bitrate_kbps: u32,
}

impl NarrationSynthesizer {
    pub fn new(
        client: ElevenLabsClient,
        store: Arc<dyn ObjectStore>,
        db: Database,
        bitrate_kbps: u32,
    ) -> Self {
        Self {
            client,
            store,
            db,
            bitrate_kbps,
        }
    }

    /// Persists synthesized bytes and records the audio object.
    pub async fn store_audio(&self, request: &NarrationRequest, audio: &[u8]) -> Result<String> {
        if audio.is_empty() {
            bail!("Text-to-speech returned no audio");
        }

        let filename = format!("{}-{}.mp3", request.owner_id, new_id());
        let url = self.store.put(&filename, audio, AUDIO_MIME_TYPE).await?;

        let object = AudioObject {
            id: new_id(),
            owner_id: request.owner_id.clone(),
            message_id: request.message_id.clone(),
            filename,
            url: url.clone(),
            size: audio.len() as i64,
            duration_seconds: estimate_duration(audio.len(), self.bitrate_kbps),
            mime_type: AUDIO_MIME_TYPE.to_string(),
        };

        if let Err(e) = self.db.insert_audio_object(&object).await {
            // Keep storage and metadata in step.
            if let Err(cleanup) = self.store.delete(&url).await {
                warn!(url = %url, "Failed to delete orphaned audio: {:#}", cleanup);
            }
            return Err(e).context("Failed to record audio object");
        }

        debug!(url = %url, size = object.size, "Stored narration");
        Ok(url)
    }
}

#[async_trait]
impl Synthesizer for NarrationSynthesizer {
    async fn synthesize(&self, request: &NarrationRequest) -> Result<String> {
        info!(voice_id = %request.voice_id, chars = request.text.len(), "Synthesizing narration");
        let audio = self
            .client
            .text_to_speech(
                &request.voice_id,
                &request.text,
                &request.model_id,
                request.settings,
            )
            .await?;
        self.store_audio(request, &audio).await
    }

    async fn voices(&self) -> Result<Vec<Voice>> {
        self.client.voices().await
    }
}

/// Constant-bitrate estimate in seconds.
pub fn estimate_duration(bytes: usize, bitrate_kbps: u32) -> Option<f64> {
    if bitrate_kbps == 0 {
        return None;
    }
    let bytes_per_second = f64::from(bitrate_kbps) * 1000.0 / 8.0;
    Some(bytes as f64 / bytes_per_second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalObjectStore;

    fn request(owner_id: &str, message_id: Option<&str>) -> NarrationRequest {
        NarrationRequest {
            text: "Email from a. Subject: b. c".to_string(),
            owner_id: owner_id.to_string(),
            message_id: message_id.map(str::to_string),
            voice_id: crate::models::DEFAULT_VOICE_ID.to_string(),
            model_id: crate::models::DEFAULT_MODEL_ID.to_string(),
            settings: VoiceSettings::default(),
        }
    }

    #[test]
    fn test_estimate_duration() {
        assert_eq!(estimate_duration(16_000, 128), Some(1.0));
        assert_eq!(estimate_duration(48_000, 128), Some(3.0));
        assert_eq!(estimate_duration(1000, 0), None);
    }

    #[tokio::test]
    async fn test_store_audio_writes_file_and_records_object() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("owner@example.com").await.unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), "/uploads/audio"));
        let synth = NarrationSynthesizer::new(
            ElevenLabsClient::new(&ElevenLabsConfig::default()),
            store,
            db.clone(),
            128,
        );

        let url = synth
            .store_audio(&request(&user.id, None), &[7u8; 32_000])
            .await
            .unwrap();

        let prefix = format!("/uploads/audio/{}-", user.id);
        assert!(url.starts_with(&prefix));
        assert!(url.ends_with(".mp3"));

        let filename = url.rsplit('/').next().unwrap();
        assert_eq!(std::fs::read(dir.path().join(filename)).unwrap().len(), 32_000);

        let objects = db.audio_for_owner(&user.id).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].url, url);
        assert_eq!(objects[0].size, 32_000);
        assert_eq!(objects[0].duration_seconds, Some(2.0));
        assert_eq!(objects[0].mime_type, AUDIO_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_empty_audio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), "/uploads/audio"));
        let synth = NarrationSynthesizer::new(
            ElevenLabsClient::new(&ElevenLabsConfig::default()),
            store,
            db,
            128,
        );

        assert!(synth.store_audio(&request("o", None), &[]).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_record_removes_stored_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), "/uploads/audio"));
        let synth = NarrationSynthesizer::new(
            ElevenLabsClient::new(&ElevenLabsConfig::default()),
            store,
            db.clone(),
            128,
        );

        // No such user, so the audio row violates its foreign key.
        let err = synth
            .store_audio(&request("ghost", None), &[1u8; 100])
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to record audio object"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(db.audio_for_owner("ghost").await.unwrap().is_empty());
    }
}
