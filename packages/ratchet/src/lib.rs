pub mod driver;
pub mod job;
pub mod worker;

pub use driver::memory::MemoryTimerDriver;
pub use driver::redis::RedisTimerDriver;
pub use driver::{TimerDriver, TimerDriverHandle};
pub use job::{JobHandler, Registry, RegistryHandle, TimerJob};
pub use worker::Worker;
