//! 提供方注册表：provider 名 -> LlmClient
//!
//! 没有凭据的提供方不会注册；路由到未注册提供方即为配置错误。

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::TaskError;
use crate::llm::{create_deepseek_client, LlmClient, OpenAiClient};

#[derive(Default, Clone)]
pub struct LlmBackends {
    clients: HashMap<String, Arc<dyn LlmClient>>,
}

impl LlmBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据环境变量中的 key 注册 openai / deepseek
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut backends = Self::new();
        match OpenAiClient::from_env(cfg.llm.openai_base_url.as_deref()) {
            Some(client) => backends.register("openai", Arc::new(client)),
            None => tracing::warn!("OPENAI_API_KEY not set; provider 'openai' unavailable"),
        }
        match create_deepseek_client(cfg.llm.deepseek_base_url.as_deref()) {
            Some(client) => backends.register("deepseek", Arc::new(client)),
            None => tracing::warn!("DEEPSEEK_API_KEY not set; provider 'deepseek' unavailable"),
        }
        backends
    }

    pub fn register(&mut self, provider: &str, client: Arc<dyn LlmClient>) {
        self.clients.insert(provider.to_string(), client);
    }

    pub fn with(mut self, provider: &str, client: Arc<dyn LlmClient>) -> Self {
        self.register(provider, client);
        self
    }

    pub fn client(&self, provider: &str) -> Result<Arc<dyn LlmClient>, TaskError> {
        self.clients.get(provider).cloned().ok_or_else(|| {
            TaskError::Configuration(format!("provider '{provider}' is not configured"))
        })
    }

    pub fn providers(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// 所有提供方的 token 使用合计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.clients
            .values()
            .map(|c| c.token_usage())
            .fold((0, 0, 0), |acc, (a, b, c)| (acc.0 + a, acc.1 + b, acc.2 + c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_missing_provider_is_configuration_error() {
        let backends = LlmBackends::new().with("mock", Arc::new(MockLlmClient::new()));
        assert!(backends.client("mock").is_ok());
        assert!(matches!(
            backends.client("openai"),
            Err(TaskError::Configuration(_))
        ));
    }
}
