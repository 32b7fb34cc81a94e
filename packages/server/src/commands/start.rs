use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use conveyor::RunQueue;
use flywheel_engine::db::memory::MemoryDatabase;
use flywheel_engine::db::postgres::PostgresDatabase;
use flywheel_engine::lock::memory::MemoryLockDriver;
use flywheel_engine::lock::redis::RedisLockDriver;
use flywheel_engine::{AllowAll, DatabaseHandle, Engine, LockManager};
use flywheel_engine::lock::LockDriverHandle;
use ratchet::{Registry, TimerDriverHandle};
use tokio::sync::watch;

#[derive(Parser)]
pub struct Opts {}

impl Opts {
	pub async fn execute(&self, config: flywheel_config::Config) -> Result<()> {
		let pools = flywheel_pools::Pools::new(config.clone()).await?;

		// Driver selection follows the config: Redis/Postgres when
		// configured, in-process memory drivers otherwise.
		let (queue_driver, timer_driver, lock_driver): (
			conveyor::QueueDriverHandle,
			TimerDriverHandle,
			LockDriverHandle,
		) = if config.redis.is_some() {
			let redis = pools.redis()?;
			let prefix = config.queue().prefix();
			(
				Arc::new(conveyor::RedisDriver::new(redis.clone())),
				Arc::new(ratchet::RedisTimerDriver::new(redis.clone(), prefix.clone())),
				Arc::new(RedisLockDriver::new(redis, prefix)),
			)
		} else {
			tracing::warn!("no redis configured, using in-process memory drivers");
			(
				Arc::new(conveyor::MemoryDriver::new()),
				Arc::new(ratchet::MemoryTimerDriver::new()),
				Arc::new(MemoryLockDriver::new()),
			)
		};

		let db: DatabaseHandle = if config.postgres.is_some() {
			let postgres = PostgresDatabase::new(pools.pg()?);
			postgres.init().await.context("failed initializing schema")?;
			Arc::new(postgres)
		} else {
			tracing::warn!("no postgres configured, using in-process memory store");
			Arc::new(MemoryDatabase::new())
		};

		let queue = RunQueue::new(config.clone(), queue_driver);
		let locks = LockManager::new(config.clone(), lock_driver);
		let engine = Engine::new(
			config.clone(),
			db,
			queue,
			timer_driver.clone(),
			locks,
			Arc::new(AllowAll),
		);

		// Delayed-job worker.
		let mut registry = Registry::new();
		engine.register_job_handlers(&mut registry)?;
		let worker = ratchet::Worker::new(config.clone(), Arc::new(registry), timer_driver);
		engine.schedule_maintenance_jobs().await?;

		let (shutdown_tx, shutdown_rx) = watch::channel(());
		let worker_handle = tokio::spawn(worker.start(Some(shutdown_rx)));

		// API server.
		let router = flywheel_api::router(config.clone(), engine).await?;
		let api_config = config.api();
		let addr: SocketAddr = format!("{}:{}", api_config.host(), api_config.port())
			.parse()
			.context("invalid api host/port")?;
		let listener = tokio::net::TcpListener::bind(addr)
			.await
			.with_context(|| format!("failed binding {addr}"))?;
		tracing::info!(%addr, "api server listening");

		axum::serve(listener, router)
			.with_graceful_shutdown(shutdown_signal())
			.await
			.context("api server failed")?;

		// Drain the worker before exiting.
		let _ = shutdown_tx.send(());
		if let Err(err) = worker_handle.await {
			tracing::warn!(?err, "worker task join failed");
		}

		tracing::info!("shutdown complete");

		Ok(())
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(_) => std::future::pending().await,
		}
	};

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}

	tracing::info!("shutdown signal received");
}
