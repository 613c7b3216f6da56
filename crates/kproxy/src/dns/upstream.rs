use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::DnsError;
use crate::telemetry::Metrics;
use crate::telemetry::metrics::UpstreamLabels;

/// How long a failed upstream sits out before being offered traffic again.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(15);

pub struct Upstream {
	pub addr: SocketAddr,
	pub name: String,
	healthy: AtomicBool,
	last_failure: Mutex<Option<Instant>>,
}

impl Upstream {
	fn usable(&self) -> bool {
		if self.healthy.load(Ordering::Relaxed) {
			return true;
		}
		// Let a cooled-down upstream prove itself again.
		self
			.last_failure
			.lock()
			.map(|at| at.elapsed() >= FAILURE_COOLDOWN)
			.unwrap_or(true)
	}

	fn mark_ok(&self) {
		self.healthy.store(true, Ordering::Relaxed);
	}

	fn mark_failed(&self) {
		self.healthy.store(false, Ordering::Relaxed);
		*self.last_failure.lock() = Some(Instant::now());
	}
}

/// Ordered upstream resolvers, tried round-robin with per-upstream health.
pub struct UpstreamPool {
	upstreams: Vec<Arc<Upstream>>,
	next: AtomicUsize,
	timeout: Duration,
	metrics: Arc<Metrics>,
}

impl UpstreamPool {
	pub fn new(
		servers: &[String],
		timeout: Duration,
		metrics: Arc<Metrics>,
	) -> Result<UpstreamPool, DnsError> {
		let upstreams = servers
			.iter()
			.map(|s| {
				let addr: SocketAddr = if s.contains(':') {
					s.parse()
						.map_err(|_| DnsError::InvalidUpstream(s.clone()))?
				} else {
					format!("{s}:53")
						.parse()
						.map_err(|_| DnsError::InvalidUpstream(s.clone()))?
				};
				Ok(Arc::new(Upstream {
					addr,
					name: s.clone(),
					healthy: AtomicBool::new(true),
					last_failure: Mutex::new(None),
				}))
			})
			.collect::<Result<Vec<_>, DnsError>>()?;
		if upstreams.is_empty() {
			return Err(DnsError::NoUpstreams);
		}
		Ok(UpstreamPool {
			upstreams,
			next: AtomicUsize::new(0),
			timeout,
			metrics,
		})
	}

	/// Forward a raw query, returning the parsed answer and the upstream that
	/// produced it. Tries every upstream once; the total deadline is the
	/// per-upstream timeout times the pool size.
	pub async fn forward(&self, query: &[u8]) -> Result<(Message, String), DnsError> {
		let start = self.next.fetch_add(1, Ordering::Relaxed);
		let n = self.upstreams.len();
		let any_usable = self.upstreams.iter().any(|u| u.usable());
		for i in 0..n {
			let upstream = &self.upstreams[(start + i) % n];
			// With every upstream cooling down, trying beats failing outright.
			if any_usable && !upstream.usable() {
				continue;
			}
			match self.query_one(upstream, query).await {
				Ok(msg) => {
					upstream.mark_ok();
					return Ok((msg, upstream.name.clone()));
				},
				Err(e) => {
					warn!(upstream = upstream.name, error = %e, "upstream query failed");
					upstream.mark_failed();
					self
						.metrics
						.dns_upstream_errors
						.get_or_create(&UpstreamLabels {
							upstream: upstream.name.clone(),
						})
						.inc();
				},
			}
		}
		Err(DnsError::AllUpstreamsFailed)
	}

	async fn query_one(&self, upstream: &Upstream, query: &[u8]) -> Result<Message, DnsError> {
		let response = tokio::time::timeout(self.timeout, self.query_udp(upstream, query))
			.await
			.map_err(|_| DnsError::UpstreamTimeout)??;
		if response.truncated() {
			debug!(upstream = upstream.name, "truncated answer, retrying over TCP");
			return tokio::time::timeout(self.timeout, self.query_tcp(upstream, query))
				.await
				.map_err(|_| DnsError::UpstreamTimeout)?;
		}
		Ok(response)
	}

	async fn query_udp(&self, upstream: &Upstream, query: &[u8]) -> Result<Message, DnsError> {
		let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
		socket.connect(upstream.addr).await?;
		socket.send(query).await?;
		let mut buf = vec![0u8; 4096];
		loop {
			let n = socket.recv(&mut buf).await?;
			let msg = Message::from_vec(&buf[..n])?;
			// Ignore stray datagrams that do not answer our query.
			if msg.id() == u16::from_be_bytes([query[0], query[1]]) {
				return Ok(msg);
			}
		}
	}

	async fn query_tcp(&self, upstream: &Upstream, query: &[u8]) -> Result<Message, DnsError> {
		let mut stream = TcpStream::connect(upstream.addr).await?;
		stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
		stream.write_all(query).await?;
		stream.flush().await?;
		let mut len = [0u8; 2];
		stream.read_exact(&mut len).await?;
		let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
		stream.read_exact(&mut buf).await?;
		Ok(Message::from_vec(&buf)?)
	}
}
