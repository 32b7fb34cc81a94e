pub mod completion;
pub mod error;
pub mod queue;
pub mod run;
pub mod snapshot;
pub mod waitpoint;

pub use completion::{Attempt, AttemptCompletion, AttemptStatus, RetryOptions};
pub use error::{EngineError, InternalErrorCode, RunError, RunErrorKind};
pub use queue::{Environment, EnvironmentType, QueueMessage, TaskQueue, TaskQueueKind};
pub use run::{Run, RunStatus};
pub use snapshot::{ExecutionSnapshot, ExecutionStatus};
pub use waitpoint::{CompletedWaitpoint, Waitpoint, WaitpointKind, WaitpointStatus};
