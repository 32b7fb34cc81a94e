pub mod driver;
pub mod fair;
pub mod keys;
pub mod queue;

pub use driver::memory::MemoryDriver;
pub use driver::redis::RedisDriver;
pub use driver::{ClaimOutcome, LimitScope, MessageKeys, QueueDriver, QueueDriverHandle};
pub use fair::FairPriorityStrategy;
pub use keys::{KeyProducer, ParsedQueueKey};
pub use queue::RunQueue;
