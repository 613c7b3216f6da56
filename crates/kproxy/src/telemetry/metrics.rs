use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub device: String,
	pub host: String,
	pub action: String,
	pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestDurationLabels {
	pub device: String,
	pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DnsQueryLabels {
	pub device: String,
	pub action: String,
	pub query_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DnsDurationLabels {
	pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
	pub upstream: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BlockedLabels {
	pub device: String,
	pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UsageLabels {
	pub device: String,
	pub category: String,
}

/// Every metric the proxy exports, registered against one registry built at
/// startup and handed to each component.
#[derive(Debug, Clone)]
pub struct Metrics {
	pub requests: Family<RequestLabels, Counter>,
	pub request_duration: Family<RequestDurationLabels, Histogram>,
	pub dns_queries: Family<DnsQueryLabels, Counter>,
	pub dns_query_duration: Family<DnsDurationLabels, Histogram>,
	pub dns_upstream_errors: Family<UpstreamLabels, Counter>,
	pub certificates_generated: Counter,
	pub certificate_cache_hits: Counter,
	pub certificate_cache_misses: Counter,
	pub blocked_requests: Family<BlockedLabels, Counter>,
	pub usage_minutes_consumed: Family<UsageLabels, Counter<f64, AtomicU64>>,
	pub active_connections: Gauge,
}

fn duration_histogram() -> Histogram {
	Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let metrics = Metrics {
			requests: Family::default(),
			request_duration: Family::new_with_constructor(duration_histogram),
			dns_queries: Family::default(),
			dns_query_duration: Family::new_with_constructor(duration_histogram),
			dns_upstream_errors: Family::default(),
			certificates_generated: Counter::default(),
			certificate_cache_hits: Counter::default(),
			certificate_cache_misses: Counter::default(),
			blocked_requests: Family::default(),
			usage_minutes_consumed: Family::default(),
			active_connections: Gauge::default(),
		};
		registry.register(
			"kproxy_requests",
			"Proxied HTTP requests",
			metrics.requests.clone(),
		);
		registry.register(
			"kproxy_request_duration_seconds",
			"Proxied HTTP request duration",
			metrics.request_duration.clone(),
		);
		registry.register(
			"kproxy_dns_queries",
			"DNS queries answered",
			metrics.dns_queries.clone(),
		);
		registry.register(
			"kproxy_dns_query_duration_seconds",
			"DNS query duration",
			metrics.dns_query_duration.clone(),
		);
		registry.register(
			"kproxy_dns_upstream_errors",
			"Upstream DNS failures",
			metrics.dns_upstream_errors.clone(),
		);
		registry.register(
			"kproxy_certificates_generated",
			"Leaf certificates minted",
			metrics.certificates_generated.clone(),
		);
		registry.register(
			"kproxy_certificates_cache_hits",
			"Leaf certificate cache hits",
			metrics.certificate_cache_hits.clone(),
		);
		registry.register(
			"kproxy_certificates_cache_misses",
			"Leaf certificate cache misses",
			metrics.certificate_cache_misses.clone(),
		);
		registry.register(
			"kproxy_blocked_requests",
			"Requests answered with the block page",
			metrics.blocked_requests.clone(),
		);
		registry.register(
			"kproxy_usage_minutes_consumed",
			"Usage minutes folded into daily totals",
			metrics.usage_minutes_consumed.clone(),
		);
		registry.register(
			"kproxy_active_connections",
			"Open proxied connections",
			metrics.active_connections.clone(),
		);
		metrics
	}

	/// A metrics instance not registered anywhere, for tests.
	#[cfg(test)]
	pub fn unregistered() -> Metrics {
		Metrics::new(&mut Registry::default())
	}
}
