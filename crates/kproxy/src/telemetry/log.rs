//! Structured access records, one event per completed request or query.
//!
//! Records go to dedicated targets (`kproxy::access`, `kproxy::dns`) so
//! operators can route or silence them independently of diagnostic logs.

use std::net::IpAddr;

use tracing::info;

pub struct RequestRecord<'a> {
	pub client_ip: IpAddr,
	pub client_mac: Option<&'a str>,
	pub method: &'a str,
	pub host: &'a str,
	pub path: &'a str,
	pub status: u16,
	pub bytes: u64,
	pub duration_ms: u64,
	pub action: &'a str,
	pub rule: &'a str,
	pub reason: &'a str,
	pub category: &'a str,
	pub encrypted: bool,
}

impl RequestRecord<'_> {
	pub fn emit(&self) {
		info!(
			target: "kproxy::access",
			client = %self.client_ip,
			mac = self.client_mac.unwrap_or(""),
			method = self.method,
			host = self.host,
			path = self.path,
			status = self.status,
			bytes = self.bytes,
			duration_ms = self.duration_ms,
			action = self.action,
			rule = self.rule,
			reason = self.reason,
			category = self.category,
			encrypted = self.encrypted,
			"request"
		);
	}
}

pub struct QueryRecord<'a> {
	pub client: IpAddr,
	pub qname: &'a str,
	pub qtype: &'a str,
	pub action: &'a str,
	pub response_ip: Option<IpAddr>,
	pub upstream: Option<&'a str>,
	pub latency_ms: u64,
}

impl QueryRecord<'_> {
	pub fn emit(&self) {
		info!(
			target: "kproxy::dns",
			client = %self.client,
			qname = self.qname,
			qtype = self.qtype,
			action = self.action,
			response_ip = self.response_ip.map(|ip| ip.to_string()).unwrap_or_default(),
			upstream = self.upstream.unwrap_or(""),
			latency_ms = self.latency_ms,
			"query"
		);
	}
}
