use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{FinalizedSession, Lease, Store, StoreError};
use crate::config::USAGE_RETENTION_DAYS;

const RETENTION_SECS: i64 = USAGE_RETENTION_DAYS as i64 * 86400;

/// One round trip per increment: upsert the row, index it under its date,
/// and refresh retention on both keys. Keeping all of it server-side is what
/// makes concurrent increments safe.
const ADD_USAGE: &str = r#"
local total = redis.call('INCRBY', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[3])
return total
"#;

pub struct RedisStore {
	conn: ConnectionManager,
	add_usage: Script,
}

fn usage_key(date: &str, device: &str, limit: &str) -> String {
	format!("usage:daily:{date}:{device}:{limit}")
}

fn index_key(date: &str) -> String {
	format!("usage:index:{date}")
}

fn member(device: &str, limit: &str) -> String {
	// '|' cannot occur in MACs, IPs, or category names.
	format!("{device}|{limit}")
}

impl RedisStore {
	pub async fn connect(url: &str) -> Result<RedisStore, StoreError> {
		let client = redis::Client::open(url).map_err(StoreError::Redis)?;
		let conn = client.get_connection_manager().await?;
		Ok(RedisStore {
			conn,
			add_usage: Script::new(ADD_USAGE),
		})
	}
}

#[async_trait::async_trait]
impl Store for RedisStore {
	async fn add_daily_usage(
		&self,
		date: &str,
		device: &str,
		limit: &str,
		seconds: u64,
	) -> Result<u64, StoreError> {
		let mut conn = self.conn.clone();
		let total: i64 = self
			.add_usage
			.key(usage_key(date, device, limit))
			.key(index_key(date))
			.arg(seconds)
			.arg(member(device, limit))
			.arg(RETENTION_SECS)
			.invoke_async(&mut conn)
			.await?;
		Ok(total.max(0) as u64)
	}

	async fn daily_usage(&self, date: &str, device: &str, limit: &str) -> Result<u64, StoreError> {
		let mut conn = self.conn.clone();
		let total: Option<u64> = conn.get(usage_key(date, device, limit)).await?;
		Ok(total.unwrap_or(0))
	}

	async fn device_usage(&self, date: &str, device: &str) -> Result<u64, StoreError> {
		let mut conn = self.conn.clone();
		let members: Vec<String> = conn.smembers(index_key(date)).await?;
		let prefix = format!("{device}|");
		let mut total = 0u64;
		for m in members {
			let Some(limit) = m.strip_prefix(&prefix) else {
				continue;
			};
			let row: Option<u64> = conn.get(usage_key(date, device, limit)).await?;
			total += row.unwrap_or(0);
		}
		Ok(total)
	}

	async fn record_session(&self, session: &FinalizedSession) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let payload = serde_json::to_string(session)?;
		let _: () = redis::cmd("SET")
			.arg(format!("session:{}", session.id))
			.arg(payload)
			.arg("EX")
			.arg(RETENTION_SECS)
			.query_async(&mut conn)
			.await?;
		Ok(())
	}

	async fn purge_usage_before(&self, cutoff: &str) -> Result<u64, StoreError> {
		// Retention TTLs already bound every key; this sweeps index sets whose
		// date fell behind the cutoff so reads stop touching them.
		let mut conn = self.conn.clone();
		let keys: Vec<String> = {
			let mut iter = conn.scan_match::<_, String>("usage:index:*").await?;
			let mut keys = Vec::new();
			while let Some(k) = iter.next_item().await {
				keys.push(k);
			}
			keys
		};
		let mut purged = 0u64;
		for key in keys {
			let Some(date) = key.strip_prefix("usage:index:") else {
				continue;
			};
			if date >= cutoff {
				continue;
			}
			let members: Vec<String> = conn.smembers(&key).await?;
			for m in &members {
				if let Some((device, limit)) = m.split_once('|') {
					let _: () = conn.del(usage_key(date, device, limit)).await?;
					purged += 1;
				}
			}
			let _: () = conn.del(&key).await?;
		}
		Ok(purged)
	}

	async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let payload = serde_json::to_string(lease)?;
		let _: () = redis::cmd("SET")
			.arg(format!("dhcp:lease:{}", lease.mac))
			.arg(payload)
			.arg("EXAT")
			.arg(lease.expires_at.timestamp().max(1))
			.query_async(&mut conn)
			.await?;
		Ok(())
	}

	async fn lease(&self, mac: &str) -> Result<Option<Lease>, StoreError> {
		let mut conn = self.conn.clone();
		let payload: Option<String> = conn.get(format!("dhcp:lease:{mac}")).await?;
		payload
			.map(|p| serde_json::from_str(&p).map_err(StoreError::Serde))
			.transpose()
	}

	async fn purge_expired_leases(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
		// Lease keys carry an absolute expiry; redis reclaims them itself.
		Ok(0)
	}
}
