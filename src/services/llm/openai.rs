use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::services::llm::{status_error, SseTokenParser};
use crate::traits::{GenerateOptions, LlmPort, ProviderError, TokenStream};

/// Generic OpenAI-compatible chat adapter. Points at any gateway speaking
/// the `/chat/completions` SSE dialect (OpenAI itself, Ollama,
/// llama-server). The model set is open; the gateway validates the name.
pub struct OpenAiLlm {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiLlm {
    pub fn new(api_key: Option<String>, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmPort for OpenAiLlm {
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_text: &str,
        opts: &GenerateOptions,
    ) -> Result<TokenStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": opts.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_text },
            ],
            "max_tokens": opts.max_tokens,
            "stream": true,
        });

        info!(
            "Opening chat stream, model: {} at {}",
            opts.model, self.base_url
        );
        let mut request = self.client.post(&url).json(&body);
        // Self-hosted gateways typically run without a key.
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let mut bytes = resp.bytes_stream().boxed();
        let stream = stream! {
            let mut parser = SseTokenParser::new();
            while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(p) => p,
                    Err(e) => {
                        yield Err(ProviderError::CallFailed(e.to_string()));
                        return;
                    }
                };
                for chunk in parser.feed(&part) {
                    let finished = chunk.finished;
                    yield Ok(chunk);
                    if finished {
                        return;
                    }
                }
            }
            debug!("Chat stream ended without [DONE]");
            yield Ok(parser.final_chunk());
        };
        Ok(Box::pin(stream))
    }
}
