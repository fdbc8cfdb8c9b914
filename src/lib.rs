//! Itinera - 视频转行程的工具调用编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、取消与超时、运行时状态、任务调度、编排入口
//! - **itinerary**: 行程领域类型与 Markdown 渲染
//! - **llm**: 模型任务路由、任务执行器、模型后端（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话消息与压缩
//! - **observability**: tracing 初始化
//! - **providers**: 视频 / 地理编码 / 图库 / 图片生成提供方
//! - **react**: 工具调用协议、主循环与过程事件
//! - **session**: 会话快照、状态与步骤账本
//! - **tools**: 工具注册表、步骤信封与行程工具

pub mod config;
pub mod core;
pub mod itinerary;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod providers;
pub mod react;
pub mod session;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TurnOutcome, TurnRequest};
pub use crate::react::TurnEvent;
