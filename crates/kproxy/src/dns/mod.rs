//! The interception-aware DNS resolver.
//!
//! Every query is classified before anything else: policy blocks win, then
//! bypass patterns and bypass decisions, and everything left is intercepted
//! so the client connects to the proxy instead of the origin. Only bypassed
//! and non-address intercepted queries ever reach an upstream resolver.

pub mod pattern;
pub mod upstream;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hickory_proto::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DefaultAction, DnsConfig};
use crate::policy::{Action, Decision, PolicyEngine, RequestFacts, evaluate_or_default};
use crate::telemetry::Metrics;
use crate::telemetry::log::QueryRecord;
use crate::telemetry::metrics::{DnsDurationLabels, DnsQueryLabels};

use pattern::PatternList;
use upstream::UpstreamPool;

/// Minimum UDP payload every DNS client can receive.
const MIN_UDP_PAYLOAD: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
	#[error("protocol: {0}")]
	Proto(#[from] ProtoError),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid upstream address {0:?}")]
	InvalidUpstream(String),
	#[error("no upstream resolvers configured")]
	NoUpstreams,
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("all upstreams failed")]
	AllUpstreamsFailed,
	#[error("invalid bypass pattern: {0}")]
	InvalidPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
	Intercept,
	Bypass,
	Block,
}

impl Classification {
	fn as_str(&self) -> &'static str {
		match self {
			Classification::Intercept => "intercept",
			Classification::Bypass => "bypass",
			Classification::Block => "block",
		}
	}
}

pub struct DnsServer {
	proxy_ip: Ipv4Addr,
	intercept_ttl: u32,
	bypass_ttl_cap: u32,
	block_ttl: u32,
	global_bypass: PatternList,
	policy: Arc<dyn PolicyEngine>,
	default_action: DefaultAction,
	upstreams: UpstreamPool,
	metrics: Arc<Metrics>,
}

impl DnsServer {
	pub fn new(
		cfg: &DnsConfig,
		proxy_ip: Ipv4Addr,
		policy: Arc<dyn PolicyEngine>,
		default_action: DefaultAction,
		metrics: Arc<Metrics>,
	) -> Result<DnsServer, DnsError> {
		let global_bypass =
			PatternList::parse(&cfg.global_bypass).map_err(DnsError::InvalidPattern)?;
		let upstreams = UpstreamPool::new(&cfg.upstream_servers, cfg.upstream_timeout, metrics.clone())?;
		Ok(DnsServer {
			proxy_ip,
			intercept_ttl: cfg.intercept_ttl.as_secs() as u32,
			bypass_ttl_cap: cfg.bypass_ttl_cap.as_secs() as u32,
			block_ttl: cfg.block_ttl.as_secs() as u32,
			global_bypass,
			policy,
			default_action,
			upstreams,
			metrics,
		})
	}

	/// Answer the UDP socket until cancelled. Each datagram is handled on its
	/// own task.
	pub async fn run_udp(
		self: Arc<Self>,
		socket: Arc<UdpSocket>,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		info!(addr = %socket.local_addr()?, "dns/udp listening");
		let mut buf = vec![0u8; 4096];
		loop {
			let (n, peer) = tokio::select! {
				res = socket.recv_from(&mut buf) => res?,
				_ = cancel.cancelled() => return Ok(()),
			};
			let query = buf[..n].to_vec();
			let server = self.clone();
			let socket = socket.clone();
			tokio::spawn(async move {
				if let Some(response) = server.handle_query(&query, peer, true).await {
					if let Err(e) = socket.send_to(&response, peer).await {
						debug!(%peer, error = %e, "failed to send dns response");
					}
				}
			});
		}
	}

	/// Answer framed queries on the TCP listener until cancelled.
	pub async fn run_tcp(
		self: Arc<Self>,
		listener: TcpListener,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		info!(addr = %listener.local_addr()?, "dns/tcp listening");
		loop {
			let (stream, peer) = tokio::select! {
				res = listener.accept() => res?,
				_ = cancel.cancelled() => return Ok(()),
			};
			let server = self.clone();
			let conn_cancel = cancel.clone();
			tokio::spawn(async move {
				tokio::select! {
					res = server.serve_tcp_conn(stream, peer) => {
						if let Err(e) = res {
							debug!(%peer, error = %e, "dns/tcp connection ended");
						}
					},
					_ = conn_cancel.cancelled() => {},
				}
			});
		}
	}

	async fn serve_tcp_conn(
		&self,
		mut stream: tokio::net::TcpStream,
		peer: SocketAddr,
	) -> Result<(), DnsError> {
		loop {
			let mut len = [0u8; 2];
			match stream.read_exact(&mut len).await {
				Ok(_) => {},
				// Clean EOF between queries.
				Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
				Err(e) => return Err(e.into()),
			}
			let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
			stream.read_exact(&mut query).await?;
			if let Some(response) = self.handle_query(&query, peer, false).await {
				stream
					.write_all(&(response.len() as u16).to_be_bytes())
					.await?;
				stream.write_all(&response).await?;
				stream.flush().await?;
			}
		}
	}

	/// Handle one wire query. Returns `None` only when the datagram is too
	/// mangled to even echo an id back at.
	pub async fn handle_query(
		&self,
		query_bytes: &[u8],
		peer: SocketAddr,
		udp: bool,
	) -> Option<Vec<u8>> {
		let start = Instant::now();
		let request = match Message::from_vec(query_bytes) {
			Ok(m) => m,
			Err(_) => return formerr_for_raw(query_bytes),
		};
		if request.op_code() != OpCode::Query {
			return encode(error_response(&request, ResponseCode::NotImp));
		}
		let Some(query) = single_question(&request) else {
			return encode(error_response(&request, ResponseCode::FormErr));
		};

		let qname = normalize_qname(&query.name().to_utf8());
		let qtype = query.query_type();
		let (classification, decision) = self.classify(&qname, peer.ip()).await;

		let mut upstream_used = None;
		let response = match classification {
			Classification::Block => self.blocked_response(&request, &query),
			Classification::Bypass => {
				match self.forward_capped(query_bytes, self.bypass_ttl_cap).await {
					Ok((msg, upstream)) => {
						upstream_used = Some(upstream);
						msg
					},
					Err(e) => {
						warn!(qname, error = %e, "bypass forwarding failed");
						error_response(&request, ResponseCode::ServFail)
					},
				}
			},
			Classification::Intercept => match qtype {
				RecordType::A => self.intercept_response(&request, &query),
				RecordType::AAAA => {
					// v6 gets NODATA so clients fall back to the intercepted
					// v4 answer.
					let mut resp = success_response(&request);
					resp.add_query(query.clone());
					resp
				},
				_ => match self.forward_capped(query_bytes, self.intercept_ttl).await {
					Ok((msg, upstream)) => {
						upstream_used = Some(upstream);
						msg
					},
					Err(e) => {
						warn!(qname, error = %e, "intercept forwarding failed");
						error_response(&request, ResponseCode::ServFail)
					},
				},
			},
		};

		let latency = start.elapsed();
		self.observe(&qname, qtype, peer.ip(), classification, &decision, &response, upstream_used.as_deref(), latency);
		encode_bounded(response, udp.then(|| udp_payload_limit(&request)))
	}

	async fn classify(&self, qname: &str, client: IpAddr) -> (Classification, Decision) {
		let facts = RequestFacts::for_dns(client, qname, Utc::now());
		let decision =
			evaluate_or_default(self.policy.as_ref(), &facts, self.default_action).await;
		// A block verdict beats every bypass source.
		let classification = match decision.action {
			Action::Block => Classification::Block,
			Action::Bypass => Classification::Bypass,
			Action::Allow if self.global_bypass.matches(qname) => Classification::Bypass,
			Action::Allow => Classification::Intercept,
		};
		(classification, decision)
	}

	fn intercept_response(&self, request: &Message, query: &Query) -> Message {
		let mut resp = success_response(request);
		resp.add_query(query.clone());
		resp.add_answer(Record::from_rdata(
			query.name().clone(),
			self.intercept_ttl,
			RData::A(A::from(self.proxy_ip)),
		));
		resp
	}

	fn blocked_response(&self, request: &Message, query: &Query) -> Message {
		match query.query_type() {
			RecordType::A => {
				let mut resp = success_response(request);
				resp.add_query(query.clone());
				resp.add_answer(Record::from_rdata(
					query.name().clone(),
					self.block_ttl,
					RData::A(A::from(Ipv4Addr::UNSPECIFIED)),
				));
				resp
			},
			RecordType::AAAA => {
				let mut resp = success_response(request);
				resp.add_query(query.clone());
				resp.add_answer(Record::from_rdata(
					query.name().clone(),
					self.block_ttl,
					RData::AAAA(AAAA::from(Ipv6Addr::UNSPECIFIED)),
				));
				resp
			},
			// The question is already echoed by error_response.
			_ => error_response(request, ResponseCode::NXDomain),
		}
	}

	async fn forward_capped(
		&self,
		query_bytes: &[u8],
		ttl_cap: u32,
	) -> Result<(Message, String), DnsError> {
		let (mut msg, upstream) = self.upstreams.forward(query_bytes).await?;
		cap_ttls(&mut msg, ttl_cap);
		msg.set_recursion_available(true);
		Ok((msg, upstream))
	}

	#[allow(clippy::too_many_arguments)]
	fn observe(
		&self,
		qname: &str,
		qtype: RecordType,
		client: IpAddr,
		classification: Classification,
		decision: &Decision,
		response: &Message,
		upstream: Option<&str>,
		latency: Duration,
	) {
		let action = classification.as_str();
		self
			.metrics
			.dns_queries
			.get_or_create(&DnsQueryLabels {
				device: client.to_string(),
				action: action.to_string(),
				query_type: qtype.to_string(),
			})
			.inc();
		self
			.metrics
			.dns_query_duration
			.get_or_create(&DnsDurationLabels {
				action: action.to_string(),
			})
			.observe(latency.as_secs_f64());
		if classification == Classification::Block {
			debug!(qname, rule = decision.rule, reason = decision.reason, "query blocked");
		}
		QueryRecord {
			client,
			qname,
			qtype: &qtype.to_string(),
			action,
			response_ip: first_address(response),
			upstream,
			latency_ms: latency.as_millis() as u64,
		}
		.emit();
	}
}

fn normalize_qname(raw: &str) -> String {
	raw.trim_end_matches('.').to_ascii_lowercase()
}

fn single_question(request: &Message) -> Option<&Query> {
	match request.queries() {
		[q] => Some(q),
		_ => None,
	}
}

fn success_response(request: &Message) -> Message {
	let mut resp = Message::new();
	resp
		.set_id(request.id())
		.set_message_type(MessageType::Response)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(request.recursion_desired())
		.set_recursion_available(true)
		.set_authoritative(false)
		.set_response_code(ResponseCode::NoError);
	resp
}

fn error_response(request: &Message, code: ResponseCode) -> Message {
	let mut resp = Message::new();
	resp
		.set_id(request.id())
		.set_message_type(MessageType::Response)
		.set_op_code(request.op_code())
		.set_recursion_desired(request.recursion_desired())
		.set_response_code(code);
	for q in request.queries() {
		resp.add_query(q.clone());
	}
	resp
}

/// FORMERR for bytes that never parsed: echo the id if even that much made
/// it through.
fn formerr_for_raw(raw: &[u8]) -> Option<Vec<u8>> {
	if raw.len() < 2 {
		return None;
	}
	let mut resp = Message::new();
	resp
		.set_id(u16::from_be_bytes([raw[0], raw[1]]))
		.set_message_type(MessageType::Response)
		.set_response_code(ResponseCode::FormErr);
	resp.to_vec().ok()
}

/// Cap record TTLs in place. OPT is skipped since its TTL field carries
/// EDNS flags, not a lifetime.
fn cap_ttls(msg: &mut Message, cap: u32) {
	let answers = msg
		.take_answers()
		.into_iter()
		.map(|r| capped(r, cap))
		.collect::<Vec<_>>();
	msg.insert_answers(answers);
	let authorities = msg
		.take_name_servers()
		.into_iter()
		.map(|r| capped(r, cap))
		.collect::<Vec<_>>();
	msg.insert_name_servers(authorities);
	let additionals = msg
		.take_additionals()
		.into_iter()
		.map(|r| capped(r, cap))
		.collect::<Vec<_>>();
	msg.insert_additionals(additionals);
}

fn capped(mut record: Record, cap: u32) -> Record {
	if record.record_type() != RecordType::OPT && record.ttl() > cap {
		record.set_ttl(cap);
	}
	record
}

fn udp_payload_limit(request: &Message) -> usize {
	request
		.extensions()
		.as_ref()
		.map(|e| e.max_payload() as usize)
		.unwrap_or(MIN_UDP_PAYLOAD)
		.max(MIN_UDP_PAYLOAD)
}

fn encode(msg: Message) -> Option<Vec<u8>> {
	msg.to_vec().ok()
}

/// Encode, truncating for UDP when the payload exceeds what the client can
/// take.
fn encode_bounded(mut msg: Message, udp_limit: Option<usize>) -> Option<Vec<u8>> {
	let bytes = msg.to_vec().ok()?;
	match udp_limit {
		Some(limit) if bytes.len() > limit => {
			msg.set_truncated(true);
			msg.take_answers();
			msg.take_name_servers();
			msg.take_additionals();
			msg.to_vec().ok()
		},
		_ => Some(bytes),
	}
}

fn first_address(msg: &Message) -> Option<IpAddr> {
	msg.answers().iter().find_map(|r| match r.data() {
		RData::A(a) => Some(IpAddr::V4(a.0)),
		RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
		_ => None,
	})
}

#[cfg(test)]
mod tests {
	use hickory_proto::rr::Name;

	use super::*;
	use crate::config::DefaultAction;
	use crate::policy::{RawRuleInput, RuleSet, RuleSetHandle};

	fn server_with_rules(rules: Vec<RawRuleInput>, global_bypass: Vec<String>) -> DnsServer {
		let cfg = DnsConfig {
			upstream_servers: vec!["127.0.0.1:1".to_string()],
			global_bypass,
			..DnsConfig::default()
		};
		let policy = Arc::new(RuleSetHandle::new(
			RuleSet::compile(rules, DefaultAction::Allow).unwrap(),
		));
		DnsServer::new(
			&cfg,
			Ipv4Addr::new(10, 0, 0, 1),
			policy,
			DefaultAction::Allow,
			Arc::new(Metrics::unregistered()),
		)
		.unwrap()
	}

	fn block_rule(host: &str) -> RawRuleInput {
		RawRuleInput {
			id: "blocked".to_string(),
			hosts: vec![host.to_string()],
			clients: Vec::new(),
			action: Action::Block,
			reason: Some("blocked by policy".to_string()),
			category: "ads".to_string(),
		}
	}

	fn query_bytes(name: &str, qtype: RecordType) -> Vec<u8> {
		let mut q = Message::new();
		q.set_id(4242)
			.set_message_type(MessageType::Query)
			.set_op_code(OpCode::Query)
			.set_recursion_desired(true);
		q.add_query(Query::query(Name::from_utf8(name).unwrap(), qtype));
		q.to_vec().unwrap()
	}

	fn peer() -> SocketAddr {
		"10.0.0.50:5353".parse().unwrap()
	}

	async fn answer(server: &DnsServer, name: &str, qtype: RecordType) -> Message {
		let bytes = server
			.handle_query(&query_bytes(name, qtype), peer(), true)
			.await
			.unwrap();
		Message::from_vec(&bytes).unwrap()
	}

	#[tokio::test]
	async fn intercepted_a_points_at_proxy() {
		let server = server_with_rules(Vec::new(), Vec::new());
		let resp = answer(&server, "news.example.com.", RecordType::A).await;
		assert_eq!(resp.id(), 4242);
		assert_eq!(resp.response_code(), ResponseCode::NoError);
		assert_eq!(resp.answers().len(), 1);
		let record = &resp.answers()[0];
		assert_eq!(record.ttl(), 60);
		assert_eq!(record.data(), &RData::A(A::from(Ipv4Addr::new(10, 0, 0, 1))));
	}

	#[tokio::test]
	async fn intercepted_aaaa_is_nodata() {
		let server = server_with_rules(Vec::new(), Vec::new());
		let resp = answer(&server, "news.example.com.", RecordType::AAAA).await;
		assert_eq!(resp.response_code(), ResponseCode::NoError);
		assert!(resp.answers().is_empty());
	}

	#[tokio::test]
	async fn blocked_a_is_zeroed() {
		let server = server_with_rules(vec![block_rule("ads.example.com")], Vec::new());
		let resp = answer(&server, "ads.example.com.", RecordType::A).await;
		assert_eq!(resp.answers().len(), 1);
		assert_eq!(resp.answers()[0].ttl(), 60);
		assert_eq!(
			resp.answers()[0].data(),
			&RData::A(A::from(Ipv4Addr::UNSPECIFIED))
		);
	}

	#[tokio::test]
	async fn blocked_other_types_are_nxdomain() {
		let server = server_with_rules(vec![block_rule("ads.example.com")], Vec::new());
		let resp = answer(&server, "ads.example.com.", RecordType::TXT).await;
		assert_eq!(resp.response_code(), ResponseCode::NXDomain);
		assert!(resp.answers().is_empty());
	}

	#[tokio::test]
	async fn block_beats_bypass() {
		let server = server_with_rules(
			vec![block_rule("tracker.bank.example")],
			vec!["*.bank.example".to_string()],
		);
		let resp = answer(&server, "tracker.bank.example.", RecordType::A).await;
		assert_eq!(
			resp.answers()[0].data(),
			&RData::A(A::from(Ipv4Addr::UNSPECIFIED))
		);
	}

	#[tokio::test]
	async fn bypass_failure_is_servfail() {
		// The only upstream is unreachable, so a bypassed query surfaces
		// SERVFAIL rather than an intercepted answer.
		let server = server_with_rules(Vec::new(), vec!["*.bank.example".to_string()]);
		let resp = answer(&server, "www.bank.example.", RecordType::A).await;
		assert_eq!(resp.response_code(), ResponseCode::ServFail);
	}

	#[tokio::test]
	async fn garbage_gets_formerr_with_echoed_id() {
		let server = server_with_rules(Vec::new(), Vec::new());
		let resp = server
			.handle_query(&[0x12, 0x34, 0xff, 0xff, 0xff], peer(), true)
			.await
			.unwrap();
		let msg = Message::from_vec(&resp).unwrap();
		assert_eq!(msg.id(), 0x1234);
		assert_eq!(msg.response_code(), ResponseCode::FormErr);
	}

	#[tokio::test]
	async fn multiple_questions_are_formerr() {
		let server = server_with_rules(Vec::new(), Vec::new());
		let mut q = Message::new();
		q.set_id(7).set_message_type(MessageType::Query).set_op_code(OpCode::Query);
		q.add_query(Query::query(
			Name::from_utf8("a.example.").unwrap(),
			RecordType::A,
		));
		q.add_query(Query::query(
			Name::from_utf8("b.example.").unwrap(),
			RecordType::A,
		));
		let resp = server
			.handle_query(&q.to_vec().unwrap(), peer(), true)
			.await
			.unwrap();
		let msg = Message::from_vec(&resp).unwrap();
		assert_eq!(msg.response_code(), ResponseCode::FormErr);
	}

	#[test]
	fn ttl_capping_skips_opt() {
		let mut msg = Message::new();
		msg.add_answer(Record::from_rdata(
			Name::from_utf8("a.example.").unwrap(),
			3600,
			RData::A(A::from(Ipv4Addr::new(192, 0, 2, 1))),
		));
		msg.add_answer(Record::from_rdata(
			Name::from_utf8("a.example.").unwrap(),
			30,
			RData::A(A::from(Ipv4Addr::new(192, 0, 2, 2))),
		));
		cap_ttls(&mut msg, 300);
		assert_eq!(msg.answers()[0].ttl(), 300);
		assert_eq!(msg.answers()[1].ttl(), 30);
	}
}
