//! Per-device, per-category time accounting.
//!
//! Activity arrives as points in time; contiguous points form a session
//! until an inactivity gap or the daily reset closes it. Closed sessions
//! fold into a daily row through the store, which is the only persistent
//! state. All public operations take `now` explicitly so the semantics are
//! testable without a clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{USAGE_RETENTION_DAYS, UsageConfig};
use crate::serdes;
use crate::store::{FinalizedSession, Store, StoreError};
use crate::telemetry::Metrics;
use crate::telemetry::metrics::UsageLabels;

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Parse a `+HH:MM` / `-HH:MM` UTC offset.
pub fn parse_tz_offset(s: &str) -> Option<FixedOffset> {
	let (sign, rest) = match s.split_at_checked(1)? {
		("+", rest) => (1i32, rest),
		("-", rest) => (-1i32, rest),
		_ => return None,
	};
	let (h, m) = rest.split_once(':')?;
	let hours: i32 = h.parse().ok()?;
	let minutes: i32 = m.parse().ok()?;
	if hours > 14 || minutes > 59 {
		return None;
	}
	FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Clone)]
pub struct Session {
	pub id: String,
	pub device: String,
	pub limit: String,
	pub category: String,
	pub started_at: DateTime<Utc>,
	pub last_activity: DateTime<Utc>,
}

impl Session {
	fn duration(&self) -> Duration {
		(self.last_activity - self.started_at)
			.to_std()
			.unwrap_or(Duration::ZERO)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStats {
	pub today_seconds: u64,
	pub remaining_seconds: u64,
	pub active: bool,
}

pub struct UsageTracker {
	sessions: Mutex<HashMap<(String, String), Session>>,
	store: Arc<dyn Store>,
	metrics: Arc<Metrics>,
	inactivity_timeout: Duration,
	min_session_duration: Duration,
	tz: FixedOffset,
	reset_time: NaiveTime,
}

impl UsageTracker {
	pub fn new(cfg: &UsageConfig, store: Arc<dyn Store>, metrics: Arc<Metrics>) -> UsageTracker {
		let tz = parse_tz_offset(&cfg.timezone).unwrap_or_else(|| {
			warn!(tz = %cfg.timezone, "unparsable timezone offset, using UTC");
			FixedOffset::east_opt(0).unwrap()
		});
		let (hour, minute) = serdes::parse_clock_time(&cfg.daily_reset_time).unwrap_or((0, 0));
		UsageTracker {
			sessions: Mutex::new(HashMap::new()),
			store,
			metrics,
			inactivity_timeout: cfg.inactivity_timeout,
			min_session_duration: cfg.min_session_duration,
			tz,
			reset_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
		}
	}

	fn date_of(&self, at: DateTime<Utc>) -> String {
		at.with_timezone(&self.tz).format("%Y-%m-%d").to_string()
	}

	/// Note activity on a (device, limit) pair. Opens a session on first
	/// sight, extends a live one, and rolls over a stale one.
	pub async fn record_activity(
		&self,
		device: &str,
		limit: &str,
		category: &str,
		now: DateTime<Utc>,
	) -> Result<(), UsageError> {
		let stale = {
			let mut sessions = self.sessions.lock();
			let key = (device.to_string(), limit.to_string());
			match sessions.get_mut(&key) {
				Some(s) if now - s.last_activity > chrono::Duration::from_std(self.inactivity_timeout).unwrap_or_default() => {
					let old = sessions.remove(&key);
					sessions.insert(key, new_session(device, limit, category, now));
					old
				},
				Some(s) => {
					if now > s.last_activity {
						s.last_activity = now;
					}
					None
				},
				None => {
					sessions.insert(key, new_session(device, limit, category, now));
					None
				},
			}
		};
		if let Some(old) = stale {
			self.finalize(old).await?;
		}
		Ok(())
	}

	/// Whether the device has used up its daily cap for this limit, counting
	/// the live session once it is old enough to be billable.
	pub async fn is_limit_exceeded(
		&self,
		device: &str,
		limit: &str,
		daily_cap_seconds: u64,
		now: DateTime<Utc>,
	) -> Result<bool, UsageError> {
		let today = self
			.store
			.daily_usage(&self.date_of(now), device, limit)
			.await?;
		let live = self.live_seconds(device, limit);
		Ok(today + live >= daily_cap_seconds)
	}

	pub async fn stats(
		&self,
		device: &str,
		limit: &str,
		daily_cap_seconds: u64,
		now: DateTime<Utc>,
	) -> Result<DeviceStats, UsageError> {
		let today = self
			.store
			.daily_usage(&self.date_of(now), device, limit)
			.await?;
		let live = self.live_seconds(device, limit);
		let used = today + live;
		Ok(DeviceStats {
			today_seconds: used,
			remaining_seconds: daily_cap_seconds.saturating_sub(used),
			active: self
				.sessions
				.lock()
				.contains_key(&(device.to_string(), limit.to_string())),
		})
	}

	fn live_seconds(&self, device: &str, limit: &str) -> u64 {
		let sessions = self.sessions.lock();
		match sessions.get(&(device.to_string(), limit.to_string())) {
			Some(s) if s.duration() >= self.min_session_duration => s.duration().as_secs(),
			_ => 0,
		}
	}

	/// Close every session idle for at least the inactivity timeout.
	pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
		let idle: Vec<Session> = {
			let mut sessions = self.sessions.lock();
			let cutoff = chrono::Duration::from_std(self.inactivity_timeout).unwrap_or_default();
			let keys: Vec<_> = sessions
				.iter()
				.filter(|(_, s)| now - s.last_activity >= cutoff)
				.map(|(k, _)| k.clone())
				.collect();
			keys
				.into_iter()
				.filter_map(|k| sessions.remove(&k))
				.collect()
		};
		let count = idle.len();
		for session in idle {
			if let Err(e) = self.finalize(session).await {
				warn!(error = %e, "failed to finalize idle session");
			}
		}
		count
	}

	/// Close every session regardless of idleness (daily reset, shutdown).
	pub async fn finalize_all(&self) -> usize {
		let all: Vec<Session> = {
			let mut sessions = self.sessions.lock();
			sessions.drain().map(|(_, s)| s).collect()
		};
		let count = all.len();
		for session in all {
			if let Err(e) = self.finalize(session).await {
				warn!(error = %e, "failed to finalize session");
			}
		}
		count
	}

	async fn finalize(&self, session: Session) -> Result<(), UsageError> {
		let duration = session.duration();
		if duration < self.min_session_duration {
			debug!(
				device = session.device,
				limit = session.limit,
				secs = duration.as_secs(),
				"discarding short session"
			);
			return Ok(());
		}
		let date = self.date_of(session.last_activity);
		let secs = duration.as_secs();
		self
			.store
			.add_daily_usage(&date, &session.device, &session.limit, secs)
			.await?;
		self
			.store
			.record_session(&FinalizedSession {
				id: session.id.clone(),
				device: session.device.clone(),
				limit: session.limit.clone(),
				category: session.category.clone(),
				started_at: session.started_at,
				ended_at: session.last_activity,
				duration_secs: secs,
				date,
			})
			.await?;
		self
			.metrics
			.usage_minutes_consumed
			.get_or_create(&UsageLabels {
				device: session.device.clone(),
				category: session.category.clone(),
			})
			.inc_by(secs as f64 / 60.0);
		debug!(
			device = session.device,
			limit = session.limit,
			secs,
			"session finalized"
		);
		Ok(())
	}

	/// Sweep idle sessions once a minute until cancelled.
	pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
		let mut tick = tokio::time::interval(Duration::from_secs(60));
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = tick.tick() => {
					let swept = self.sweep(Utc::now()).await;
					if swept > 0 {
						debug!(swept, "idle sessions finalized");
					}
				},
				_ = cancel.cancelled() => return,
			}
		}
	}

	/// At the configured local time: fold everything in and purge rows past
	/// retention. Errors are logged; the next day retries.
	pub async fn run_daily_reset(self: Arc<Self>, cancel: CancellationToken) {
		loop {
			let now = Utc::now();
			let wait = self.until_next_reset(now);
			tokio::select! {
				_ = tokio::time::sleep(wait) => {},
				_ = cancel.cancelled() => return,
			}
			let finalized = self.finalize_all().await;
			info!(finalized, "daily usage reset");
			let cutoff = self.date_of(
				Utc::now() - chrono::Duration::days(USAGE_RETENTION_DAYS as i64),
			);
			match self.store.purge_usage_before(&cutoff).await {
				Ok(purged) if purged > 0 => info!(purged, cutoff, "purged expired usage rows"),
				Ok(_) => {},
				Err(e) => warn!(error = %e, "usage purge failed"),
			}
			if let Err(e) = self.store.purge_expired_leases(Utc::now()).await {
				warn!(error = %e, "lease purge failed");
			}
		}
	}

	fn until_next_reset(&self, now: DateTime<Utc>) -> Duration {
		let local = now.with_timezone(&self.tz);
		let mut next = local.date_naive().and_time(self.reset_time);
		if next <= local.naive_local() {
			next += chrono::Duration::days(1);
		}
		let next_utc = next
			.and_local_timezone(self.tz)
			.single()
			.map(|d| d.with_timezone(&Utc))
			.unwrap_or(now);
		(next_utc - now).to_std().unwrap_or(Duration::from_secs(60))
	}
}

fn new_session(device: &str, limit: &str, category: &str, now: DateTime<Utc>) -> Session {
	Session {
		id: format!("{device}:{limit}:{}", now.timestamp_millis()),
		device: device.to_string(),
		limit: limit.to_string(),
		category: category.to_string(),
		started_at: now,
		last_activity: now,
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;
	use crate::config::UsageConfig;
	use crate::store::MemoryStore;

	fn tracker() -> (Arc<UsageTracker>, Arc<MemoryStore>) {
		let store = Arc::new(MemoryStore::default());
		let metrics = Arc::new(Metrics::unregistered());
		let cfg = UsageConfig::default();
		(
			Arc::new(UsageTracker::new(&cfg, store.clone(), metrics)),
			store,
		)
	}

	fn t(secs: i64) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
	}

	#[tokio::test]
	async fn repeated_activity_extends_one_session() {
		let (tracker, _) = tracker();
		for i in 0..5 {
			tracker
				.record_activity("d1", "gaming", "gaming", t(i))
				.await
				.unwrap();
		}
		let sessions = tracker.sessions.lock();
		assert_eq!(sessions.len(), 1);
		let s = sessions.values().next().unwrap();
		assert_eq!(s.started_at, t(0));
		assert_eq!(s.last_activity, t(4));
	}

	#[tokio::test]
	async fn at_most_one_active_session_per_key() {
		let (tracker, _) = tracker();
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		// Gap beyond the inactivity timeout rolls the session over.
		tracker
			.record_activity("d1", "gaming", "gaming", t(400))
			.await
			.unwrap();
		assert_eq!(tracker.sessions.lock().len(), 1);
	}

	#[tokio::test]
	async fn stale_rollover_folds_old_session_into_daily_total() {
		let (tracker, store) = tracker();
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		tracker
			.record_activity("d1", "gaming", "gaming", t(30))
			.await
			.unwrap();
		tracker
			.record_activity("d1", "gaming", "gaming", t(600))
			.await
			.unwrap();
		assert_eq!(
			store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(),
			30
		);
	}

	#[tokio::test]
	async fn sweeper_finalizes_idle_sessions() {
		let (tracker, store) = tracker();
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		tracker
			.record_activity("d1", "gaming", "gaming", t(5))
			.await
			.unwrap();

		// Not yet idle long enough.
		assert_eq!(tracker.sweep(t(60)).await, 0);

		// Past the timeout: finalized, but 5s < min_session_duration → discarded.
		assert_eq!(tracker.sweep(t(130)).await, 1);
		assert_eq!(
			store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(),
			0
		);
	}

	#[tokio::test]
	async fn sweeper_folds_long_enough_sessions() {
		let (tracker, store) = tracker();
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		tracker
			.record_activity("d1", "gaming", "gaming", t(45))
			.await
			.unwrap();
		assert_eq!(tracker.sweep(t(45 + 120)).await, 1);
		assert_eq!(
			store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(),
			45
		);
		assert!(tracker.sessions.lock().is_empty());
	}

	#[tokio::test]
	async fn limit_crossing_blocks() {
		let (tracker, store) = tracker();
		store
			.add_daily_usage("2026-08-01", "d1", "gaming", 3590)
			.await
			.unwrap();

		// First request opens a session; live time is still 0.
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		assert!(
			!tracker
				.is_limit_exceeded("d1", "gaming", 3600, t(0))
				.await
				.unwrap()
		);

		// Ten seconds later the live session is billable and crosses the cap.
		tracker
			.record_activity("d1", "gaming", "gaming", t(10))
			.await
			.unwrap();
		assert!(
			tracker
				.is_limit_exceeded("d1", "gaming", 3600, t(10))
				.await
				.unwrap()
		);
	}

	#[tokio::test]
	async fn finalize_all_ignores_idleness() {
		let (tracker, store) = tracker();
		tracker
			.record_activity("d1", "gaming", "gaming", t(0))
			.await
			.unwrap();
		tracker
			.record_activity("d1", "gaming", "gaming", t(20))
			.await
			.unwrap();
		assert_eq!(tracker.finalize_all().await, 1);
		assert_eq!(
			store.daily_usage("2026-08-01", "d1", "gaming").await.unwrap(),
			20
		);
	}

	#[tokio::test]
	async fn stats_reports_usage_and_remaining() {
		let (tracker, store) = tracker();
		store
			.add_daily_usage("2026-08-01", "d1", "video", 1000)
			.await
			.unwrap();
		let stats = tracker.stats("d1", "video", 3600, t(0)).await.unwrap();
		assert_eq!(
			stats,
			DeviceStats {
				today_seconds: 1000,
				remaining_seconds: 2600,
				active: false,
			}
		);
	}

	#[test]
	fn tz_offsets() {
		assert_eq!(
			parse_tz_offset("+02:00").unwrap().local_minus_utc(),
			2 * 3600
		);
		assert_eq!(
			parse_tz_offset("-05:30").unwrap().local_minus_utc(),
			-(5 * 3600 + 30 * 60)
		);
		assert!(parse_tz_offset("UTC").is_none());
		assert!(parse_tz_offset("+25:00").is_none());
	}

	#[test]
	fn reset_is_next_midnight_in_offset() {
		let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
		let metrics = Arc::new(Metrics::unregistered());
		let cfg = UsageConfig {
			timezone: "+02:00".to_string(),
			..UsageConfig::default()
		};
		let tracker = UsageTracker::new(&cfg, store, metrics);
		// 23:00 UTC on Jul 31 is 01:00 on Aug 1 in +02:00; next local
		// midnight is 22:00 UTC on Aug 1.
		let now = Utc.with_ymd_and_hms(2026, 7, 31, 23, 0, 0).unwrap();
		assert_eq!(
			tracker.until_next_reset(now),
			Duration::from_secs(23 * 3600)
		);
	}
}
