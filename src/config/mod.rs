use serde::Deserialize;

use crate::characters::CharacterCard;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Extra character cards merged over the built-in defaults.
    #[serde(default)]
    pub characters: Vec<CharacterCard>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
    pub host: String,
}

/// Per-session conversation settings, snapshotted at connection open.
#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_asr_provider")]
    pub asr_provider: String,
    #[serde(default = "default_asr_model")]
    pub asr_model: String,
    #[serde(default = "default_asr_sample_rate")]
    pub asr_sample_rate: u32,
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_tts_provider")]
    pub tts_provider: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_tts_speed")]
    pub tts_speed: f32,
    #[serde(default = "default_tts_volume")]
    pub tts_volume: f32,
    #[serde(default = "default_character_id")]
    pub character_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_asr_provider() -> String {
    "zhipu".to_string()
}

fn default_asr_model() -> String {
    "chirp-beta".to_string()
}

fn default_asr_sample_rate() -> u32 {
    16000
}

fn default_llm_provider() -> String {
    "zhipu".to_string()
}

fn default_llm_model() -> String {
    "glm-4-flash".to_string()
}

fn default_tts_provider() -> String {
    "zhipu".to_string()
}

fn default_tts_model() -> String {
    "glm-tts".to_string()
}

fn default_tts_voice() -> String {
    "female".to_string()
}

fn default_tts_speed() -> f32 {
    1.0
}

fn default_tts_volume() -> f32 {
    1.0
}

fn default_character_id() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    256
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            asr_provider: default_asr_provider(),
            asr_model: default_asr_model(),
            asr_sample_rate: default_asr_sample_rate(),
            llm_provider: default_llm_provider(),
            llm_model: default_llm_model(),
            tts_provider: default_tts_provider(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            tts_speed: default_tts_speed(),
            tts_volume: default_tts_volume(),
            character_id: default_character_id(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub zhipu: Option<ZhipuSettings>,
    #[serde(default)]
    pub openai: Option<OpenAiSettings>,
}

#[derive(Debug, Deserialize)]
pub struct ZhipuSettings {
    pub api_key: String,
    #[serde(default = "default_zhipu_base_url")]
    pub base_url: String,
}

fn default_zhipu_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}

#[derive(Debug, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Wall-clock deadline for any single provider call or chunk read.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    30000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("Settings.toml").required(false))
            .add_source(config::Environment::with_prefix("VOICE_GATEWAY").separator("__"));

        builder.build()?.try_deserialize()
    }
}
