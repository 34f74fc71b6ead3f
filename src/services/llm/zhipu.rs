use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::services::llm::{status_error, SseTokenParser};
use crate::traits::{GenerateOptions, LlmPort, ProviderError, TokenStream};

const SUPPORTED_MODELS: &[&str] = &["glm-4-flash", "glm-4-air", "glm-4-plus", "glm-4"];

/// Zhipu (bigmodel.cn) chat adapter, OpenAI-compatible `paas/v4` dialect.
pub struct ZhipuLlm {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ZhipuLlm {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmPort for ZhipuLlm {
    fn supports_model(&self, model: &str) -> bool {
        SUPPORTED_MODELS.contains(&model)
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

        info!("Opening Zhipu chat stream, model: {}", opts.model);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
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
            // Upstream closed without a terminator; synthesize one so the
            // consumer always sees a finished chunk.
            debug!("Zhipu stream ended without [DONE]");
            yield Ok(parser.final_chunk());
        };
        Ok(Box::pin(stream))
    }
}
