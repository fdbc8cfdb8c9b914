//! 编排层：Planner 协议、工具调用主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::TurnEvent;
pub use loop_::{LoopError, ToolLoop};
pub use planner::{parse_llm_output, MalformedToolCall, Planner, PlannerOutput, ToolCall};
