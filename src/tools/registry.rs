//! 工具注册表
//!
//! 工具是编排模型在一个回合内可调用的外部操作；执行时拿到本回合运行时状态的可变引用与取消令牌。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, TaskError, ToolOutput};
use crate::providers::ProviderError;

/// 工具体内的失败
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// 缺少前置数据（如尚未抽取行程）
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ToolError::Cancelled => true,
            ToolError::Task(e) => e.is_cancelled(),
            ToolError::Provider(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// 配置类故障：回合应终止
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Task(TaskError::Configuration(_)))
    }
}

/// 参数解析失败统一映射为 InvalidArgs
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数的 JSON Schema，默认无参数
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        args: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// 按名称索引的工具集合（名称有序，提示词稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 给编排模型的工具说明（每行一个工具）
    pub fn tool_descriptions(&self) -> String {
        self.tools
            .values()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// OpenAI function calling 风格的工具 schema 列表
    pub fn to_schema_json(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect();
        Value::Array(tools)
    }
}
