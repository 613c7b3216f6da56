use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{FinalizedSession, Lease, Store, StoreError};

#[derive(Default)]
struct Inner {
	/// (date, device, limit) -> seconds
	daily: HashMap<(String, String, String), u64>,
	sessions: HashMap<String, FinalizedSession>,
	leases: HashMap<String, Lease>,
}

/// Process-local store. The unit-test backend and the degraded mode when
/// redis is unreachable.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn add_daily_usage(
		&self,
		date: &str,
		device: &str,
		limit: &str,
		seconds: u64,
	) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock();
		let entry = inner
			.daily
			.entry((date.to_string(), device.to_string(), limit.to_string()))
			.or_insert(0);
		*entry += seconds;
		Ok(*entry)
	}

	async fn daily_usage(&self, date: &str, device: &str, limit: &str) -> Result<u64, StoreError> {
		let inner = self.inner.lock();
		Ok(
			inner
				.daily
				.get(&(date.to_string(), device.to_string(), limit.to_string()))
				.copied()
				.unwrap_or(0),
		)
	}

	async fn device_usage(&self, date: &str, device: &str) -> Result<u64, StoreError> {
		let inner = self.inner.lock();
		Ok(
			inner
				.daily
				.iter()
				.filter(|((d, dev, _), _)| d == date && dev == device)
				.map(|(_, secs)| secs)
				.sum(),
		)
	}

	async fn record_session(&self, session: &FinalizedSession) -> Result<(), StoreError> {
		self
			.inner
			.lock()
			.sessions
			.insert(session.id.clone(), session.clone());
		Ok(())
	}

	async fn purge_usage_before(&self, cutoff: &str) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock();
		let before = inner.daily.len() + inner.sessions.len();
		// YYYY-MM-DD sorts chronologically as text.
		inner.daily.retain(|(date, _, _), _| date.as_str() >= cutoff);
		inner.sessions.retain(|_, s| s.date.as_str() >= cutoff);
		Ok((before - inner.daily.len() - inner.sessions.len()) as u64)
	}

	async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError> {
		self
			.inner
			.lock()
			.leases
			.insert(lease.mac.clone(), lease.clone());
		Ok(())
	}

	async fn lease(&self, mac: &str) -> Result<Option<Lease>, StoreError> {
		Ok(self.inner.lock().leases.get(mac).cloned())
	}

	async fn purge_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock();
		let before = inner.leases.len();
		inner.leases.retain(|_, l| l.expires_at > now);
		Ok((before - inner.leases.len()) as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn daily_usage_accumulates_atomically() {
		let store = std::sync::Arc::new(MemoryStore::default());
		let mut handles = Vec::new();
		for _ in 0..16 {
			let store = store.clone();
			handles.push(tokio::spawn(async move {
				for _ in 0..50 {
					store
						.add_daily_usage("2026-08-01", "d1", "gaming", 1)
						.await
						.unwrap();
				}
			}));
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(
			store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(),
			800
		);
	}

	#[tokio::test]
	async fn device_usage_sums_limits() {
		let store = MemoryStore::default();
		store
			.add_daily_usage("2026-08-01", "d1", "gaming", 100)
			.await
			.unwrap();
		store
			.add_daily_usage("2026-08-01", "d1", "video", 40)
			.await
			.unwrap();
		store
			.add_daily_usage("2026-08-01", "d2", "video", 9)
			.await
			.unwrap();
		assert_eq!(store.device_usage("2026-08-01", "d1").await.unwrap(), 140);
	}

	#[tokio::test]
	async fn purge_drops_old_dates_only() {
		let store = MemoryStore::default();
		store
			.add_daily_usage("2026-04-01", "d1", "gaming", 5)
			.await
			.unwrap();
		store
			.add_daily_usage("2026-08-01", "d1", "gaming", 7)
			.await
			.unwrap();
		let purged = store.purge_usage_before("2026-05-03").await.unwrap();
		assert_eq!(purged, 1);
		assert_eq!(store.daily_usage("2026-04-01", "d1", "gaming").await.unwrap(), 0);
		assert_eq!(store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(), 7);
	}

	#[tokio::test]
	async fn leases_expire() {
		let store = MemoryStore::default();
		let now = Utc::now();
		store
			.put_lease(&Lease {
				mac: "aa:bb:cc:dd:ee:ff".to_string(),
				ip: "10.0.0.9".parse().unwrap(),
				hostname: "laptop".to_string(),
				expires_at: now + chrono::Duration::seconds(60),
			})
			.await
			.unwrap();
		assert!(store.lease("aa:bb:cc:dd:ee:ff").await.unwrap().is_some());
		store
			.purge_expired_leases(now + chrono::Duration::seconds(120))
			.await
			.unwrap();
		assert!(store.lease("aa:bb:cc:dd:ee:ff").await.unwrap().is_none());
	}
}
