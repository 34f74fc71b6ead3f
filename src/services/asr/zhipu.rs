use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::protocol::frame::AudioFormat;
use crate::traits::{AsrPort, ProviderError, Transcript, TranscribeOptions};

const SUPPORTED_MODELS: &[&str] = &["chirp-beta", "glm-asr"];

/// Zhipu transcription adapter. The upstream endpoint is file-oriented, so
/// the capture is staged in a scoped temp file; dropping the handle deletes
/// it on every exit path, including errors and cancellation.
pub struct ZhipuAsr {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ZhipuAsr {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Writes the capture to a temp file. Raw PCM16LE is wrapped in a WAV
/// container so the upload is self-describing; container formats go out
/// as-is.
fn stage_capture(audio: &[u8], opts: &TranscribeOptions) -> Result<NamedTempFile, ProviderError> {
    let tmp = tempfile::Builder::new()
        .prefix("capture-")
        .suffix(opts.format.file_ext())
        .tempfile()
        .map_err(|e| ProviderError::CallFailed(format!("temp file: {}", e)))?;

    match opts.format {
        AudioFormat::Pcm16le => {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: opts.sample_rate.unwrap_or(16000),
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer = hound::WavWriter::new(tmp.as_file(), spec)
                .map_err(|e| ProviderError::CallFailed(format!("wav header: {}", e)))?;
            for sample in audio.chunks_exact(2) {
                writer
                    .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                    .map_err(|e| ProviderError::CallFailed(format!("wav body: {}", e)))?;
            }
            writer
                .finalize()
                .map_err(|e| ProviderError::CallFailed(format!("wav finalize: {}", e)))?;
        }
        _ => {
            use std::io::Write;
            tmp.as_file()
                .write_all(audio)
                .map_err(|e| ProviderError::CallFailed(format!("stage audio: {}", e)))?;
        }
    }
    Ok(tmp)
}

#[async_trait]
impl AsrPort for ZhipuAsr {
    fn supports_model(&self, model: &str) -> bool {
        SUPPORTED_MODELS.contains(&model)
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        opts: &TranscribeOptions,
    ) -> Result<Transcript, ProviderError> {
        if audio.is_empty() {
            return Err(ProviderError::AudioRejected("empty capture".to_string()));
        }
        if !audio.len().is_multiple_of(2) && opts.format == AudioFormat::Pcm16le {
            return Err(ProviderError::AudioRejected(
                "PCM capture has odd byte length".to_string(),
            ));
        }

        let staged = stage_capture(audio, opts)?;
        debug!(
            "Staged {} byte capture at {}",
            audio.len(),
            staged.path().display()
        );

        let file = tokio::fs::File::open(staged.path())
            .await
            .map_err(|e| ProviderError::CallFailed(format!("reopen staged file: {}", e)))?;
        let part = Part::stream(Body::wrap_stream(ReaderStream::new(file)))
            .file_name(format!("capture{}", opts.format.file_ext()));
        let mut form = Form::new().text("model", opts.model.clone()).part("file", part);
        if let Some(language) = &opts.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 415 => ProviderError::AudioRejected(text),
                404 => ProviderError::ModelUnsupported(opts.model.clone()),
                429 | 500..=599 => ProviderError::Unavailable(format!("status {}", status)),
                _ => ProviderError::CallFailed(format!("status {}: {}", status, text)),
            });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::CallFailed(format!("bad response body: {}", e)))?;
        let text = value["text"]
            .as_str()
            .ok_or_else(|| ProviderError::CallFailed("response missing text".to_string()))?
            .to_string();
        let confidence = value["confidence"].as_f64().map(|c| c as f32);

        info!("Transcribed {} bytes -> {:?}", audio.len(), text);
        Ok(Transcript { text, confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(format: AudioFormat) -> TranscribeOptions {
        TranscribeOptions {
            model: "chirp-beta".into(),
            format,
            sample_rate: Some(16000),
            language: None,
        }
    }

    #[test]
    fn declares_its_models() {
        let asr = ZhipuAsr::new("key".into(), "http://localhost".into());
        assert!(asr.supports_model("chirp-beta"));
        assert!(asr.supports_model("glm-asr"));
        assert!(!asr.supports_model("whisper-1"));
    }

    #[tokio::test]
    async fn rejects_empty_capture_before_any_io() {
        let asr = ZhipuAsr::new("key".into(), "http://localhost".into());
        let err = asr.transcribe(&[], &opts(AudioFormat::Webm)).await.unwrap_err();
        assert!(matches!(err, ProviderError::AudioRejected(_)));
    }

    #[test]
    fn pcm_capture_is_wrapped_in_wav() {
        let pcm: Vec<u8> = [100i16, -100, 2000, -2000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let staged = stage_capture(&pcm, &opts(AudioFormat::Pcm16le)).unwrap();

        let mut reader = hound::WavReader::open(staged.path()).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![100, -100, 2000, -2000]);
    }

    #[test]
    fn container_formats_are_staged_verbatim() {
        let bytes = vec![0x1A, 0x45, 0xDF, 0xA3];
        let staged = stage_capture(&bytes, &opts(AudioFormat::Webm)).unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), bytes);
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }
}
