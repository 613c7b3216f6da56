//! Persistent state behind a narrow interface.
//!
//! Daily usage rows, finalized session records, and DHCP leases live here.
//! The proxy only ever goes through [`Store`]; the memory implementation
//! doubles as the degraded mode when a remote backend goes away mid-run.

mod memory;
mod redis;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("redis: {0}")]
	Redis(#[from] ::redis::RedisError),
	#[error("serialization: {0}")]
	Serde(#[from] serde_json::Error),
}

/// A finished usage session, folded into the daily total and kept as an
/// audit record until retention expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedSession {
	pub id: String,
	pub device: String,
	pub limit: String,
	pub category: String,
	pub started_at: DateTime<Utc>,
	pub ended_at: DateTime<Utc>,
	pub duration_secs: u64,
	/// Rollup date (`YYYY-MM-DD` in the configured offset).
	pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	pub mac: String,
	pub ip: std::net::IpAddr,
	pub hostname: String,
	pub expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
	/// Add to one daily row and return the new total. Must be atomic against
	/// concurrent increments of the same row.
	async fn add_daily_usage(
		&self,
		date: &str,
		device: &str,
		limit: &str,
		seconds: u64,
	) -> Result<u64, StoreError>;

	async fn daily_usage(&self, date: &str, device: &str, limit: &str) -> Result<u64, StoreError>;

	/// Total across every limit for one device on one date.
	async fn device_usage(&self, date: &str, device: &str) -> Result<u64, StoreError>;

	async fn record_session(&self, session: &FinalizedSession) -> Result<(), StoreError>;

	/// Drop usage rows and session records for dates strictly before
	/// `cutoff` (`YYYY-MM-DD`). Returns how many rows went away.
	async fn purge_usage_before(&self, cutoff: &str) -> Result<u64, StoreError>;

	async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError>;
	async fn lease(&self, mac: &str) -> Result<Option<Lease>, StoreError>;
	async fn purge_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Wraps a remote store; every failed call is answered from an in-memory
/// store instead so usage tracking keeps working while the backend is down.
pub struct FallbackStore {
	primary: Arc<dyn Store>,
	fallback: MemoryStore,
}

impl FallbackStore {
	pub fn new(primary: Arc<dyn Store>) -> FallbackStore {
		FallbackStore {
			primary,
			fallback: MemoryStore::default(),
		}
	}
}

macro_rules! with_fallback {
	($self:ident, $op:literal, $call:ident ( $($arg:expr),* )) => {
		match $self.primary.$call($($arg),*).await {
			Ok(v) => Ok(v),
			Err(e) => {
				warn!(error = %e, op = $op, "store unavailable, serving from memory");
				$self.fallback.$call($($arg),*).await
			},
		}
	};
}

#[async_trait::async_trait]
impl Store for FallbackStore {
	async fn add_daily_usage(
		&self,
		date: &str,
		device: &str,
		limit: &str,
		seconds: u64,
	) -> Result<u64, StoreError> {
		with_fallback!(self, "add_daily_usage", add_daily_usage(date, device, limit, seconds))
	}

	async fn daily_usage(&self, date: &str, device: &str, limit: &str) -> Result<u64, StoreError> {
		with_fallback!(self, "daily_usage", daily_usage(date, device, limit))
	}

	async fn device_usage(&self, date: &str, device: &str) -> Result<u64, StoreError> {
		with_fallback!(self, "device_usage", device_usage(date, device))
	}

	async fn record_session(&self, session: &FinalizedSession) -> Result<(), StoreError> {
		with_fallback!(self, "record_session", record_session(session))
	}

	async fn purge_usage_before(&self, cutoff: &str) -> Result<u64, StoreError> {
		with_fallback!(self, "purge_usage_before", purge_usage_before(cutoff))
	}

	async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError> {
		with_fallback!(self, "put_lease", put_lease(lease))
	}

	async fn lease(&self, mac: &str) -> Result<Option<Lease>, StoreError> {
		with_fallback!(self, "lease", lease(mac))
	}

	async fn purge_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
		with_fallback!(self, "purge_expired_leases", purge_expired_leases(now))
	}
}
