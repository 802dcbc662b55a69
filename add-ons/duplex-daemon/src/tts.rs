//! OpenAI-compatible speech synthesis, streamed as raw PCM16.

use crate::settings::TtsConfig;
use bytes::{BufMut, Bytes, BytesMut};
use duplex_voice::{TtsClient, VoiceError, VoiceResult};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// `POST {base_url}/audio/speech` with `response_format = "pcm"`.
pub struct OpenAiTts {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    sample_rate: u32,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(config: &TtsConfig) -> VoiceResult<Self> {
        if config.api_key.is_empty() {
            return Err(VoiceError::Config(
                "TTS requires tts.api_key, TTS_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            sample_rate: config.sample_rate,
            client,
        })
    }
}

impl TtsClient for OpenAiTts {
    fn synthesize(&self, text: &str) -> BoxStream<'static, VoiceResult<Bytes>> {
        let url = format!("{}/audio/speech", self.base_url);
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let request = self.client.post(url).bearer_auth(&self.api_key).json(&body);
        debug!(chars = text.len(), "Requesting speech");

        let response = async move {
            let response = request
                .send()
                .await
                .map_err(|e| VoiceError::Tts(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(VoiceError::Tts(format!("TTS API {}: {}", status, detail)));
            }
            Ok(response
                .bytes_stream()
                .map_err(|e| VoiceError::Tts(e.to_string())))
        };

        let mut aligner = SampleAligner::default();
        stream::once(response)
            .try_flatten()
            .map_ok(move |chunk| aligner.align(chunk))
            .try_filter(|chunk| future::ready(!chunk.is_empty()))
            .boxed()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Re-cuts a byte stream so every chunk holds whole 16-bit samples.
#[derive(Debug, Default)]
struct SampleAligner {
    pending: Option<u8>,
}

impl SampleAligner {
    fn align(&mut self, chunk: Bytes) -> Bytes {
        if self.pending.is_none() && chunk.len() % 2 == 0 {
            return chunk;
        }
        let mut buf = BytesMut::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.pending.take() {
            buf.put_u8(byte);
        }
        buf.extend_from_slice(&chunk);
        if buf.len() % 2 == 1 {
            self.pending = buf.last().copied();
            buf.truncate(buf.len() - 1);
        }
        buf.freeze()
    }
}
