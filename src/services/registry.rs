use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::traits::{AsrPort, LlmPort, TtsPort};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no such {kind} provider: {name}")]
    NoSuchProvider { kind: &'static str, name: String },
    #[error("{kind} provider '{name}' does not support model '{model}'")]
    NoSuchModel {
        kind: &'static str,
        name: String,
        model: String,
    },
}

/// Maps `(kind, providerName)` to an adapter. Populated at startup from the
/// server config; immutable afterwards, so lookups need no locking.
#[derive(Default)]
pub struct ProviderRegistry {
    asr: HashMap<String, Arc<dyn AsrPort>>,
    llm: HashMap<String, Arc<dyn LlmPort>>,
    tts: HashMap<String, Arc<dyn TtsPort>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asr(&mut self, name: impl Into<String>, port: Arc<dyn AsrPort>) {
        self.asr.insert(name.into(), port);
    }

    pub fn register_llm(&mut self, name: impl Into<String>, port: Arc<dyn LlmPort>) {
        self.llm.insert(name.into(), port);
    }

    pub fn register_tts(&mut self, name: impl Into<String>, port: Arc<dyn TtsPort>) {
        self.tts.insert(name.into(), port);
    }

    pub fn resolve_asr(&self, name: &str, model: &str) -> Result<Arc<dyn AsrPort>, RegistryError> {
        let port = self.asr.get(name).ok_or_else(|| RegistryError::NoSuchProvider {
            kind: "asr",
            name: name.to_string(),
        })?;
        if !port.supports_model(model) {
            return Err(RegistryError::NoSuchModel {
                kind: "asr",
                name: name.to_string(),
                model: model.to_string(),
            });
        }
        Ok(Arc::clone(port))
    }

    pub fn resolve_llm(&self, name: &str, model: &str) -> Result<Arc<dyn LlmPort>, RegistryError> {
        let port = self.llm.get(name).ok_or_else(|| RegistryError::NoSuchProvider {
            kind: "llm",
            name: name.to_string(),
        })?;
        if !port.supports_model(model) {
            return Err(RegistryError::NoSuchModel {
                kind: "llm",
                name: name.to_string(),
                model: model.to_string(),
            });
        }
        Ok(Arc::clone(port))
    }

    pub fn resolve_tts(&self, name: &str, model: &str) -> Result<Arc<dyn TtsPort>, RegistryError> {
        let port = self.tts.get(name).ok_or_else(|| RegistryError::NoSuchProvider {
            kind: "tts",
            name: name.to_string(),
        })?;
        if !port.supports_model(model) {
            return Err(RegistryError::NoSuchModel {
                kind: "tts",
                name: name.to_string(),
                model: model.to_string(),
            });
        }
        Ok(Arc::clone(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{GenerateOptions, ProviderError, TokenStream};
    use async_trait::async_trait;

    struct FixedModelLlm;

    #[async_trait]
    impl LlmPort for FixedModelLlm {
        fn supports_model(&self, model: &str) -> bool {
            model == "glm-4-flash"
        }

        async fn generate_stream(
            &self,
            _system_prompt: &str,
            _user_text: &str,
            _opts: &GenerateOptions,
        ) -> Result<TokenStream, ProviderError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    #[test]
    fn resolves_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm("zhipu", Arc::new(FixedModelLlm));
        assert!(registry.resolve_llm("zhipu", "glm-4-flash").is_ok());
    }

    #[test]
    fn missing_provider_is_distinct_from_missing_model() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm("zhipu", Arc::new(FixedModelLlm));

        match registry.resolve_llm("acme", "glm-4-flash") {
            Err(RegistryError::NoSuchProvider { name, .. }) => assert_eq!(name, "acme"),
            other => panic!("expected NoSuchProvider, got {:?}", other.err()),
        }
        match registry.resolve_llm("zhipu", "gpt-oss") {
            Err(RegistryError::NoSuchModel { model, .. }) => assert_eq!(model, "gpt-oss"),
            other => panic!("expected NoSuchModel, got {:?}", other.err()),
        }
    }
}
