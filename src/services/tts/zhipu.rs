use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::protocol::frame::AudioFormat;
use crate::traits::{AudioChunk, AudioStream, ProviderError, SynthesizeOptions, TtsPort};

const SUPPORTED_MODELS: &[&str] = &["glm-tts", "cogtts"];

fn format_name(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Pcm16le => "pcm",
        AudioFormat::Wav => "wav",
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Opus => "opus",
        AudioFormat::Webm => "webm",
        AudioFormat::Unknown => "pcm",
    }
}

/// Zhipu speech synthesis adapter. Yields the chunked response body in the
/// requested container format; the pipeline asks for raw PCM16LE.
pub struct ZhipuTts {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ZhipuTts {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TtsPort for ZhipuTts {
    fn supports_model(&self, model: &str) -> bool {
        SUPPORTED_MODELS.contains(&model)
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        opts: &SynthesizeOptions,
    ) -> Result<AudioStream, ProviderError> {
        let url = format!("{}/audio/speech", self.base_url);
        let body = json!({
            "model": opts.model,
            "input": text,
            "voice": opts.voice,
            "speed": opts.speed,
            "volume": opts.volume,
            "response_format": format_name(opts.format),
            "stream": true,
        });

        info!(
            "Synthesizing {} chars with voice '{}' ({})",
            text.chars().count(),
            opts.voice,
            opts.model
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                404 => ProviderError::ModelUnsupported(opts.model.clone()),
                429 | 500..=599 => ProviderError::Unavailable(format!("status {}", status)),
                _ => ProviderError::CallFailed(format!("status {}: {}", status, text)),
            });
        }

        let format = opts.format;
        let mut bytes = resp.bytes_stream().boxed();
        let stream = stream! {
            let mut total = 0usize;
            while let Some(part) = bytes.next().await {
                match part {
                    Ok(b) => {
                        if b.is_empty() {
                            continue;
                        }
                        total += b.len();
                        yield Ok(AudioChunk {
                            bytes: b.to_vec(),
                            format,
                            finished: false,
                        });
                    }
                    Err(e) => {
                        yield Err(ProviderError::CallFailed(e.to_string()));
                        return;
                    }
                }
            }
            debug!("Synthesis stream complete, {} bytes", total);
            yield Ok(AudioChunk {
                bytes: Vec::new(),
                format,
                finished: true,
            });
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_its_models() {
        let tts = ZhipuTts::new("key".into(), "http://localhost".into());
        assert!(tts.supports_model("glm-tts"));
        assert!(!tts.supports_model("tts-1"));
    }

    #[test]
    fn pipeline_format_maps_to_pcm() {
        assert_eq!(format_name(AudioFormat::Pcm16le), "pcm");
        assert_eq!(format_name(AudioFormat::Mp3), "mp3");
    }
}
