//! 会话持久化：快照合并、会话存储 / 步骤账本接口与实现

pub mod persistent;
pub mod snapshot;
pub mod store;

#[cfg(feature = "async-sqlite")]
pub use persistent::SqliteSessionStore;
pub use snapshot::{SessionSnapshot, SnapshotPatch};
pub use store::{
    MemorySessionStore, SessionStatus, SessionStore, StepLedger, StepLedgerEntry, StepStatus,
};
