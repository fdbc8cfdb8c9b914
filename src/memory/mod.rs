//! 记忆层：对话消息模型与对话压缩

pub mod compaction;
pub mod conversation;

pub use compaction::{
    CompactionMode, CompactionPolicy, CompactionResult, ConversationCompactor,
};
pub use conversation::{Message, MessagePart, Role, ToolCallState};
