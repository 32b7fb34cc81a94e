pub mod db;
pub mod engine;
pub mod entitlement;
pub mod jobs;
pub mod lock;
pub mod notify;

pub use db::{Database, DatabaseHandle};
pub use engine::trigger::TriggerRequest;
pub use engine::Engine;
pub use entitlement::{AllowAll, EntitlementChecker};
pub use lock::{LockDriver, LockManager};
pub use notify::{NoopNotifier, RunNotifier};
