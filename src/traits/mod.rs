use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;

use crate::protocol::frame::AudioFormat;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("model not supported: {0}")]
    ModelUnsupported(String),
    #[error("audio rejected: {0}")]
    AudioRejected(String),
    #[error("provider call failed: {0}")]
    CallFailed(String),
    #[error("provider deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub model: String,
    pub format: AudioFormat,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub max_tokens: u32,
}

/// One increment of the LLM output. `accumulated` always carries the full
/// text so far, so a consumer never has to reassemble deltas itself.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    pub delta: String,
    pub accumulated: String,
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct SynthesizeOptions {
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub volume: f32,
    pub format: AudioFormat,
}

#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub finished: bool,
}

pub type TokenStream = BoxStream<'static, Result<TokenChunk, ProviderError>>;
pub type AudioStream = BoxStream<'static, Result<AudioChunk, ProviderError>>;

/// Speech recognition port. Adapters are stateless across turns.
#[async_trait]
pub trait AsrPort: Send + Sync {
    fn supports_model(&self, model: &str) -> bool;

    async fn transcribe(
        &self,
        audio: &[u8],
        opts: &TranscribeOptions,
    ) -> Result<Transcript, ProviderError>;

    /// Streaming facade over `transcribe`. The default buffers the whole
    /// capture, then makes a single call and yields exactly one final result.
    async fn transcribe_stream(
        &self,
        mut chunks: BoxStream<'_, Vec<u8>>,
        opts: &TranscribeOptions,
    ) -> Result<Transcript, ProviderError> {
        let mut audio = Vec::new();
        while let Some(chunk) = chunks.next().await {
            audio.extend_from_slice(&chunk);
        }
        self.transcribe(&audio, opts).await
    }
}

/// Text generation port. The returned stream must terminate the upstream
/// call within bounded time when dropped.
#[async_trait]
pub trait LlmPort: Send + Sync {
    fn supports_model(&self, model: &str) -> bool;

    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_text: &str,
        opts: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError>;
}

/// Speech synthesis port. Chunks arrive in the requested container format;
/// the pipeline asks for PCM16LE and Opus-encodes on egress.
#[async_trait]
pub trait TtsPort: Send + Sync {
    fn supports_model(&self, model: &str) -> bool;

    async fn synthesize_stream(
        &self,
        text: &str,
        opts: &SynthesizeOptions,
    ) -> Result<AudioStream, ProviderError>;
}
