//! 核心层：错误与恢复、取消与超时、运行时状态、任务调度、优雅关闭、编排入口

pub mod builder;
pub mod cancel;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use builder::OrchestratorBuilder;
pub use cancel::{any_of, Deadline, Interrupt};
pub use error::{StepError, StoreError, TaskError, TurnError};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnRequest, STOPPED_RESPONSE};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{
    ImagePrecedence, ItineraryOutput, LocationReport, RuntimeState, ToolOutput, TripContext,
    TripSummary,
};
pub use task_scheduler::TaskScheduler;
