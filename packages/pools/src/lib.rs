use std::sync::Arc;

use anyhow::{Context, Result};
use flywheel_config::Config;
use tokio_util::sync::{CancellationToken, DropGuard};

pub type RedisPool = redis::aio::ConnectionManager;
pub type PgPool = sqlx::PgPool;

pub(crate) struct PoolsInner {
	pub(crate) _guard: DropGuard,
	pub(crate) redis: Option<RedisPool>,
	pub(crate) pg: Option<PgPool>,
}

/// Shared connection pools. Which pools exist is driven by config; callers
/// that need an absent pool get an error rather than a panic.
#[derive(Clone)]
pub struct Pools(Arc<PoolsInner>);

impl Pools {
	#[tracing::instrument(skip(config))]
	pub async fn new(config: Config) -> Result<Pools> {
		let token = CancellationToken::new();

		let redis = if let Some(redis_config) = &config.redis {
			let client = redis::Client::open(redis_config.url.as_str())
				.context("failed creating redis client")?;
			let manager = client
				.get_connection_manager()
				.await
				.context("failed connecting to redis")?;
			tracing::debug!("connected to redis");
			Some(manager)
		} else {
			None
		};

		let pg = if let Some(pg_config) = &config.postgres {
			let pool = sqlx::postgres::PgPoolOptions::new()
				.max_connections(pg_config.max_connections())
				.connect(&pg_config.url)
				.await
				.context("failed connecting to postgres")?;
			tracing::debug!("connected to postgres");
			Some(pool)
		} else {
			None
		};

		Ok(Pools(Arc::new(PoolsInner {
			_guard: token.drop_guard(),
			redis,
			pg,
		})))
	}

	/// Empty pool set. The memory drivers need no connections.
	pub fn empty() -> Pools {
		let token = CancellationToken::new();
		Pools(Arc::new(PoolsInner {
			_guard: token.drop_guard(),
			redis: None,
			pg: None,
		}))
	}

	// MARK: Pool lookups
	pub fn redis(&self) -> Result<RedisPool> {
		self.0.redis.clone().context("missing redis pool")
	}

	pub fn redis_option(&self) -> &Option<RedisPool> {
		&self.0.redis
	}

	pub fn pg(&self) -> Result<PgPool> {
		self.0.pg.clone().context("missing postgres pool")
	}

	pub fn pg_option(&self) -> &Option<PgPool> {
		&self.0.pg
	}
}
