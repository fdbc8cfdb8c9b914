//! 编排器构建器：统一的初始化逻辑
//!
//! CLI 与测试共用同一套装配：路由表、后端、提供方、会话存储、系统提示词。
//! 未显式指定的部分按配置构建。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::TaskScheduler;
use crate::llm::{LlmBackends, ModelTaskRouter, TaskExecutor};
use crate::memory::ConversationCompactor;
use crate::providers::Providers;
use crate::react::Planner;
use crate::session::{SessionStore, StepLedger};
use crate::tools::ToolDeps;

const DEFAULT_PREVIEW_DIR: &str = "previews";

pub struct OrchestratorBuilder {
    config: AppConfig,
    router: Option<ModelTaskRouter>,
    backends: Option<LlmBackends>,
    providers: Option<Providers>,
    store: Option<(Arc<dyn SessionStore>, Arc<dyn StepLedger>)>,
    system_prompt: Option<String>,
    preview_dir: PathBuf,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            router: None,
            backends: None,
            providers: None,
            store: None,
            system_prompt: None,
            preview_dir: PathBuf::from(DEFAULT_PREVIEW_DIR),
        }
    }

    pub fn with_router(mut self, router: ModelTaskRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_backends(mut self, backends: LlmBackends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    /// 同一个对象同时充当会话存储与步骤账本
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: SessionStore + StepLedger + 'static,
    {
        let session: Arc<dyn SessionStore> = store.clone();
        let ledger: Arc<dyn StepLedger> = store;
        self.store = Some((session, ledger));
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    /// 从 config/prompts/system.md 加载系统提示词；找不到时用内置提示词
    pub fn with_system_prompt_from_file(mut self) -> Self {
        self.system_prompt = ["config/prompts/system.md", "../config/prompts/system.md"]
            .into_iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self
    }

    pub fn with_preview_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preview_dir = dir.into();
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Orchestrator {
        let router = self
            .router
            .unwrap_or_else(|| ModelTaskRouter::from_config(&self.config));
        let backends = self
            .backends
            .unwrap_or_else(|| LlmBackends::from_config(&self.config));
        let providers = self
            .providers
            .unwrap_or_else(|| Providers::http(&self.config.providers));

        let executor = Arc::new(TaskExecutor::new(Arc::new(router), Arc::new(backends)));
        let compactor = ConversationCompactor::from_config(executor.clone(), &self.config.compaction);
        let scheduler = Arc::new(TaskScheduler::new(
            self.config.orchestrator.max_concurrent_branches,
        ));
        let planner = match self.system_prompt {
            Some(prompt) => Planner::new(prompt),
            None => Planner::default(),
        };

        Orchestrator {
            executor: executor.clone(),
            compactor,
            deps: ToolDeps {
                executor,
                providers,
                scheduler,
            },
            store: self.store,
            planner,
            settings: self.config.orchestrator.clone(),
            preview_dir: self.preview_dir.to_string_lossy().into_owned(),
        }
    }
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::session::MemorySessionStore;

    #[test]
    fn test_build_uses_config_settings() {
        let mut config = AppConfig::default();
        config.orchestrator.max_steps = 3;
        let orchestrator = Orchestrator::builder(config)
            .with_router(ModelTaskRouter::defaults().with_provider("mock"))
            .with_backends(LlmBackends::new().with("mock", Arc::new(MockLlmClient::new())))
            .with_store(Arc::new(MemorySessionStore::new()))
            .with_system_prompt("You plan trips.")
            .build();
        assert_eq!(orchestrator.settings().max_steps, 3);
        assert_eq!(orchestrator.planner.base_system_prompt(), "You plan trips.");
        assert!(orchestrator.store.is_some());
    }
}
