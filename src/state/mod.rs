use std::sync::Arc;

use tracing::{info, warn};

use crate::characters::CharacterRegistry;
use crate::config::ServerConfig;
use crate::services::asr::zhipu::ZhipuAsr;
use crate::services::llm::openai::OpenAiLlm;
use crate::services::llm::zhipu::ZhipuLlm;
use crate::services::registry::ProviderRegistry;
use crate::services::tts::zhipu::ZhipuTts;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub providers: Arc<ProviderRegistry>,
    pub characters: Arc<CharacterRegistry>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let mut providers = ProviderRegistry::new();

        if let Some(zhipu) = &config.providers.zhipu {
            info!("Registering Zhipu providers at {}", zhipu.base_url);
            providers.register_asr(
                "zhipu",
                Arc::new(ZhipuAsr::new(zhipu.api_key.clone(), zhipu.base_url.clone())),
            );
            providers.register_llm(
                "zhipu",
                Arc::new(ZhipuLlm::new(zhipu.api_key.clone(), zhipu.base_url.clone())),
            );
            providers.register_tts(
                "zhipu",
                Arc::new(ZhipuTts::new(zhipu.api_key.clone(), zhipu.base_url.clone())),
            );
        }

        if let Some(openai) = &config.providers.openai {
            info!("Registering OpenAI-compatible LLM at {}", openai.base_url);
            providers.register_llm(
                "openai",
                Arc::new(OpenAiLlm::new(
                    openai.api_key.clone(),
                    openai.base_url.clone(),
                )),
            );
        }

        if config.providers.zhipu.is_none() && config.providers.openai.is_none() {
            warn!("No providers configured; every turn will fail until one is added");
        }

        let characters = CharacterRegistry::new(&config.characters);

        Self {
            config: Arc::new(config),
            providers: Arc::new(providers),
            characters: Arc::new(characters),
        }
    }
}
