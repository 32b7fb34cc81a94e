//! Runner-side implementation of the supervisor protocol.
//!
//! A runner long-polls the platform for work, executes one attempt at a
//! time through a [`TaskExecutor`], heartbeats while executing, reacts to
//! snapshot changes (cancellation, waitpoints, suspension), and warm-starts
//! into the next run when an attempt ends. Fully programmatic, which also
//! makes it the test harness for the platform: executors can crash with
//! specific errors, sleep on waitpoints, or ignore cancellation.

mod client;
mod config;
mod executor;
mod runner;

pub use client::{ClientError, PlatformClient};
pub use config::{RunnerConfig, RunnerConfigBuilder};
pub use executor::{
	AttemptHandle, EchoExecutor, ExecutionContext, FailNTimesExecutor, SleepExecutor,
	TaskExecutor, WaitForDurationExecutor,
};
pub use runner::Runner;
