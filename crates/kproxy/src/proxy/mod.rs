//! The HTTP and HTTPS proxy servers.
//!
//! Both listeners share one handler; the only difference is that the HTTPS
//! side terminates TLS with certificates minted by the authority and flags
//! requests as encrypted. Policy runs per request, allowed traffic streams
//! through to the origin derived from the Host header, and blocked traffic
//! gets the block page.

pub mod arp;
pub mod setup;
pub mod timeout;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::uri::Uri;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ca::{Authority, CertResolver};
use crate::config::DefaultAction;
use crate::policy::{Action, Decision, PolicyEngine, RequestFacts, evaluate_or_default};
use crate::telemetry::Metrics;
use crate::telemetry::log::RequestRecord;
use crate::telemetry::metrics::{BlockedLabels, RequestDurationLabels, RequestLabels};
use crate::usage::UsageTracker;

use arp::ArpCache;
use timeout::TimedStream;

pub type Body = UnsyncBoxBody<Bytes, anyhow::Error>;

/// Total budget for one upstream exchange; forwarded request bodies are
/// uploaded within it, which is what bounds slow client uploads.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for reading a request head, and for the TLS handshake.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Write-progress deadline towards the client; a stalled response write
/// drops the connection.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Read-inactivity deadline; reaps idle keep-alive connections and any
/// read stall the other timeouts don't cover.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Headers that exist per hop and must not be forwarded either way.
fn hop_by_hop() -> [header::HeaderName; 8] {
	[
		header::CONNECTION,
		header::HeaderName::from_static("keep-alive"),
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	]
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("invalid target host {0:?}")]
	InvalidHost(String),
	#[error("upstream request failed: {0}")]
	Upstream(#[from] hyper_util::client::legacy::Error),
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("http: {0}")]
	Http(#[from] http::Error),
}

pub struct ProxySettings {
	pub operator_hostname: String,
	pub resolve_mac: bool,
	pub default_action: DefaultAction,
	/// Daily per-device caps in seconds, keyed by decision category.
	pub limits: HashMap<String, u64>,
	/// Per-listener cap on concurrently served connections.
	pub max_connections: usize,
}

/// Everything the request handler needs, shared across both listeners.
pub struct ProxyInputs {
	settings: ProxySettings,
	policy: Arc<dyn PolicyEngine>,
	usage: Arc<UsageTracker>,
	authority: Arc<Authority>,
	metrics: Arc<Metrics>,
	arp: ArpCache,
	client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl ProxyInputs {
	pub fn new(
		mut settings: ProxySettings,
		policy: Arc<dyn PolicyEngine>,
		usage: Arc<UsageTracker>,
		authority: Arc<Authority>,
		metrics: Arc<Metrics>,
	) -> std::io::Result<ProxyInputs> {
		settings.operator_hostname = settings.operator_hostname.to_ascii_lowercase();
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_native_roots()?
			.https_or_http()
			.enable_http1()
			.build();
		let client = Client::builder(TokioExecutor::new()).build(https);
		Ok(ProxyInputs {
			settings,
			policy,
			usage,
			authority,
			metrics,
			arp: ArpCache::new(),
			client,
		})
	}
}

/// TLS termination config: SNI-driven minted certificates, TLS 1.2+,
/// HTTP/1.1 only.
pub fn tls_server_config(authority: Arc<Authority>) -> ServerConfig {
	let mut config = ServerConfig::builder_with_protocol_versions(&[
		&rustls::version::TLS13,
		&rustls::version::TLS12,
	])
	.with_no_client_auth()
	.with_cert_resolver(Arc::new(CertResolver(authority)));
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	config
}

pub async fn run_http(
	inputs: Arc<ProxyInputs>,
	listener: TcpListener,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "http listening");
	let limiter = Arc::new(Semaphore::new(inputs.settings.max_connections.max(1)));
	loop {
		let permit = limiter
			.clone()
			.acquire_owned()
			.await
			.expect("listener semaphore never closes");
		let (stream, peer) = tokio::select! {
			res = listener.accept() => res?,
			_ = cancel.cancelled() => return Ok(()),
		};
		let inputs = inputs.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			inputs.metrics.active_connections.inc();
			serve_conn(inputs.clone(), stream, peer, false, None, cancel).await;
			inputs.metrics.active_connections.dec();
			drop(permit);
		});
	}
}

pub async fn run_https(
	inputs: Arc<ProxyInputs>,
	listener: TcpListener,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "https listening");
	let acceptor = TlsAcceptor::from(Arc::new(tls_server_config(inputs.authority.clone())));
	let limiter = Arc::new(Semaphore::new(inputs.settings.max_connections.max(1)));
	loop {
		let permit = limiter
			.clone()
			.acquire_owned()
			.await
			.expect("listener semaphore never closes");
		let (stream, peer) = tokio::select! {
			res = listener.accept() => res?,
			_ = cancel.cancelled() => return Ok(()),
		};
		let inputs = inputs.clone();
		let acceptor = acceptor.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			let tls_stream =
				match tokio::time::timeout(READ_TIMEOUT, acceptor.accept(stream)).await {
					Ok(Ok(s)) => s,
					Ok(Err(e)) => {
						debug!(%peer, error = %e, "tls handshake failed");
						return;
					},
					Err(_) => {
						debug!(%peer, "tls handshake timed out");
						return;
					},
				};
			let sni = tls_stream
				.get_ref()
				.1
				.server_name()
				.map(|s| s.to_string());
			inputs.metrics.active_connections.inc();
			serve_conn(inputs.clone(), tls_stream, peer, true, sni, cancel).await;
			inputs.metrics.active_connections.dec();
			drop(permit);
		});
	}
}

async fn serve_conn<S>(
	inputs: Arc<ProxyInputs>,
	stream: S,
	peer: SocketAddr,
	encrypted: bool,
	sni: Option<String>,
	cancel: CancellationToken,
) where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let service = service_fn(move |req: Request<Incoming>| {
		let inputs = inputs.clone();
		let sni = sni.clone();
		async move {
			Ok::<_, std::convert::Infallible>(handle(inputs, req, peer, encrypted, sni).await)
		}
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.header_read_timeout(READ_TIMEOUT)
		.serve_connection(
			TokioIo::new(TimedStream::new(stream, IDLE_TIMEOUT, WRITE_TIMEOUT)),
			service,
		);
	tokio::pin!(conn);
	tokio::select! {
		res = conn.as_mut() => {
			if let Err(e) = res {
				debug!(%peer, error = %e, "connection ended with error");
			}
		},
		_ = cancel.cancelled() => {
			conn.as_mut().graceful_shutdown();
			let _ = conn.as_mut().await;
		},
	}
}

/// The shared request handler. Never fails: every error becomes a response.
async fn handle<B>(
	inputs: Arc<ProxyInputs>,
	req: Request<B>,
	peer: SocketAddr,
	encrypted: bool,
	sni: Option<String>,
) -> Response<Body>
where
	B: http_body::Body<Data = Bytes> + Send + 'static,
	B::Error: std::error::Error + Send + Sync + 'static,
{
	let start = Instant::now();
	let now = Utc::now();

	let client_ip = client_ip(req.headers(), peer);
	let client_mac = inputs
		.settings
		.resolve_mac
		.then(|| inputs.arp.lookup(client_ip))
		.flatten();

	// The logo is addressable on every host so block pages can embed it.
	if req.uri().path() == "/.kproxy/logo.png" {
		return setup::serve_logo(req.headers().get(header::IF_NONE_MATCH));
	}

	let authority = host_authority(&req, sni.as_deref());
	let host = strip_port(&authority).to_ascii_lowercase();
	if host.is_empty() {
		return plain(StatusCode::BAD_REQUEST, "missing host");
	}

	if host == inputs.settings.operator_hostname {
		if !encrypted {
			// The setup surface only exists over TLS.
			let location = format!(
				"https://{}{}",
				host,
				req
					.uri()
					.path_and_query()
					.map(|pq| pq.as_str())
					.unwrap_or("/")
			);
			return Response::builder()
				.status(StatusCode::MOVED_PERMANENTLY)
				.header(header::LOCATION, location)
				.body(empty())
				.expect("static response");
		}
		return setup::route(&inputs.authority, req.method(), req.uri().path());
	}

	let facts = RequestFacts {
		client_ip,
		client_mac: client_mac.clone(),
		host: host.clone(),
		path: req.uri().path().to_string(),
		method: req.method().to_string(),
		user_agent: req
			.headers()
			.get(header::USER_AGENT)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string(),
		encrypted,
		timestamp: now,
	};
	let mut decision =
		evaluate_or_default(inputs.policy.as_ref(), &facts, inputs.settings.default_action).await;
	// Bypass only means something at the DNS layer.
	if decision.action == Action::Bypass {
		decision.action = Action::Allow;
	}

	let device = facts.device_id();
	let target_url = format!(
		"{}://{}{}",
		if encrypted { "https" } else { "http" },
		authority,
		req.uri().path()
	);

	if decision.action == Action::Allow
		&& !decision.category.is_empty()
		&& let Some(&cap) = inputs.settings.limits.get(&decision.category)
	{
		let exceeded = inputs
			.usage
			.is_limit_exceeded(&device, &decision.category, cap, now)
			.await
			.unwrap_or(false);
		if exceeded {
			decision = Decision {
				action: Action::Block,
				reason: format!("Daily time limit for '{}' exceeded", decision.category),
				rule: "usage-limit".to_string(),
				category: decision.category,
			};
		}
	}

	let response = match decision.action {
		Action::Block => {
			inputs
				.metrics
				.blocked_requests
				.get_or_create(&BlockedLabels {
					device: device.clone(),
					reason: decision.reason.clone(),
				})
				.inc();
			block_page(&decision.reason, &device, &target_url, now)
		},
		Action::Allow | Action::Bypass => {
			match forward(&inputs, req, &authority, encrypted).await {
				Ok(resp) => {
					if !decision.category.is_empty() {
						record_usage(&inputs, &device, &decision.category, now);
					}
					resp
				},
				Err(e) => {
					warn!(host, error = %e, "upstream request failed");
					plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
				},
			}
		},
	};

	let duration = start.elapsed();
	let action = decision.action.as_str();
	inputs
		.metrics
		.requests
		.get_or_create(&RequestLabels {
			device: device.clone(),
			host: host.clone(),
			action: action.to_string(),
			method: facts.method.clone(),
		})
		.inc();
	inputs
		.metrics
		.request_duration
		.get_or_create(&RequestDurationLabels {
			device: device.clone(),
			action: action.to_string(),
		})
		.observe(duration.as_secs_f64());
	RequestRecord {
		client_ip,
		client_mac: client_mac.as_deref(),
		method: &facts.method,
		host: &host,
		path: &facts.path,
		status: response.status().as_u16(),
		bytes: http_body::Body::size_hint(response.body())
			.exact()
			.unwrap_or(0),
		duration_ms: duration.as_millis() as u64,
		action,
		rule: &decision.rule,
		reason: &decision.reason,
		category: &decision.category,
		encrypted,
	}
	.emit();

	response
}

/// Stream the request to the origin named by the Host header and stream the
/// answer back, minus hop-by-hop headers in both directions.
async fn forward<B>(
	inputs: &ProxyInputs,
	req: Request<B>,
	authority: &str,
	encrypted: bool,
) -> Result<Response<Body>, ProxyError>
where
	B: http_body::Body<Data = Bytes> + Send + 'static,
	B::Error: std::error::Error + Send + Sync + 'static,
{
	let scheme = if encrypted { "https" } else { "http" };
	let path_and_query = req
		.uri()
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let uri: Uri = format!("{scheme}://{authority}{path_and_query}")
		.parse()
		.map_err(|_| ProxyError::InvalidHost(authority.to_string()))?;

	let (mut parts, body) = req.into_parts();
	parts.uri = uri;
	strip_hop_by_hop(&mut parts.headers);
	let upstream_req = Request::from_parts(parts, body.map_err(anyhow::Error::new).boxed_unsync());

	let response = tokio::time::timeout(UPSTREAM_TIMEOUT, inputs.client.request(upstream_req))
		.await
		.map_err(|_| ProxyError::UpstreamTimeout)??;

	let (mut parts, body) = response.into_parts();
	strip_hop_by_hop(&mut parts.headers);
	Ok(Response::from_parts(
		parts,
		body.map_err(anyhow::Error::new).boxed_unsync(),
	))
}

/// Decisions carry no separate limit id, so the category is the limit key.
fn record_usage(inputs: &Arc<ProxyInputs>, device: &str, category: &str, now: chrono::DateTime<Utc>) {
	let usage = inputs.usage.clone();
	let device = device.to_string();
	let category = category.to_string();
	tokio::spawn(async move {
		if let Err(e) = usage
			.record_activity(&device, &category, &category, now)
			.await
		{
			warn!(device, category, error = %e, "failed to record usage activity");
		}
	});
}

/// First valid address in X-Forwarded-For, else X-Real-IP, else the socket
/// peer.
fn client_ip(headers: &header::HeaderMap, peer: SocketAddr) -> IpAddr {
	if let Some(xff) = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
	{
		for candidate in xff.split(',') {
			if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
				return ip;
			}
		}
	}
	if let Some(ip) = headers
		.get("x-real-ip")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<IpAddr>().ok())
	{
		return ip;
	}
	peer.ip()
}

fn host_authority<B>(req: &Request<B>, sni: Option<&str>) -> String {
	req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.trim().to_string())
		.or_else(|| req.uri().authority().map(|a| a.to_string()))
		.or_else(|| sni.map(|s| s.to_string()))
		.unwrap_or_default()
}

/// Drop the `:port` suffix without mangling IPv6 literals.
fn strip_port(authority: &str) -> &str {
	if let Some(end) = authority.rfind(']') {
		return &authority[..=end];
	}
	match authority.rsplit_once(':') {
		Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
		_ => authority,
	}
}

/// Remove the fixed hop-by-hop set plus anything the Connection header
/// nominates.
fn strip_hop_by_hop(headers: &mut header::HeaderMap) {
	let nominated: Vec<header::HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| name.trim().parse::<header::HeaderName>().ok())
		.collect();
	for name in &hop_by_hop() {
		headers.remove(name);
	}
	for name in nominated {
		headers.remove(&name);
	}
}

fn block_page(
	reason: &str,
	device: &str,
	url: &str,
	at: chrono::DateTime<Utc>,
) -> Response<Body> {
	let body = format!(
		r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Blocked</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #f6f8fa; color: #1f2328; margin: 0; }}
  main {{ max-width: 36rem; margin: 4rem auto; padding: 0 1rem; }}
  .card {{ background: #fff; border: 1px solid #d1d9e0; border-left: 4px solid #cf222e;
           border-radius: 8px; padding: 2rem; }}
  h1 {{ display: flex; align-items: center; gap: .6rem; font-size: 1.3rem; }}
  h1 img {{ width: 28px; height: 28px; }}
  dt {{ font-weight: 600; margin-top: .8rem; }}
  dd {{ margin: .2rem 0 0; word-break: break-all; }}
</style>
</head>
<body>
<main>
  <div class="card">
    <h1><img src="/.kproxy/logo.png" alt=""> This page is blocked</h1>
    <dl>
      <dt>Reason</dt><dd>{reason}</dd>
      <dt>Address</dt><dd>{url}</dd>
      <dt>Device</dt><dd>{device}</dd>
      <dt>Time</dt><dd>{time}</dd>
    </dl>
  </div>
</main>
</body>
</html>
"#,
		reason = escape_html(reason),
		url = escape_html(url),
		device = escape_html(device),
		time = at.format("%Y-%m-%d %H:%M:%S UTC"),
	);
	Response::builder()
		.status(StatusCode::FORBIDDEN)
		.header(header::CONTENT_TYPE, "text/html; charset=utf-8")
		.body(full(body.into_bytes()))
		.expect("static response")
}

fn escape_html(s: &str) -> String {
	s.replace('&', "&amp;")
		.replace('<', "&lt;")
		.replace('>', "&gt;")
		.replace('"', "&quot;")
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full(message.as_bytes()))
		.expect("static response")
}

pub(crate) fn full(body: impl Into<Bytes>) -> Body {
	Full::new(body.into())
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub(crate) fn empty() -> Body {
	Empty::<Bytes>::new()
		.map_err(|never| match never {})
		.boxed_unsync()
}

#[cfg(test)]
mod tests {
	use http::Method;
	use http_body_util::BodyExt as _;
	use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, KeyUsagePurpose};

	use super::*;
	use crate::config::{DefaultAction, TlsConfig, UsageConfig};
	use crate::policy::{RawRuleInput, RuleSet, RuleSetHandle};
	use crate::store::MemoryStore;

	fn self_signed_ca(cn: &str) -> (String, String) {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, cn);
		params.distinguished_name = dn;
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		let cert = params.self_signed(&key).unwrap();
		(cert.pem(), key.serialize_pem())
	}

	fn test_inputs(rules: Vec<RawRuleInput>, limits: HashMap<String, u64>) -> (Arc<ProxyInputs>, Vec<u8>, tempfile::TempDir) {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		let dir = tempfile::tempdir().unwrap();
		let (root_pem, _) = self_signed_ca("Test Root");
		let (int_pem, int_key) = self_signed_ca("Test Intermediate");
		std::fs::write(dir.path().join("ca.crt"), &root_pem).unwrap();
		std::fs::write(dir.path().join("int.crt"), &int_pem).unwrap();
		std::fs::write(dir.path().join("int.key"), &int_key).unwrap();
		let tls = TlsConfig {
			ca_cert: dir.path().join("ca.crt"),
			intermediate_cert: dir.path().join("int.crt"),
			intermediate_key: dir.path().join("int.key"),
			..TlsConfig::default()
		};
		let metrics = Arc::new(Metrics::unregistered());
		let authority =
			Arc::new(Authority::load(&tls, "kproxy.lan", metrics.clone()).unwrap());
		let store = Arc::new(MemoryStore::default());
		let usage = Arc::new(UsageTracker::new(
			&UsageConfig::default(),
			store,
			metrics.clone(),
		));
		let policy = Arc::new(RuleSetHandle::new(
			RuleSet::compile(rules, DefaultAction::Allow).unwrap(),
		));
		let inputs = ProxyInputs::new(
			ProxySettings {
				operator_hostname: "kproxy.lan".to_string(),
				resolve_mac: false,
				default_action: DefaultAction::Allow,
				limits,
				max_connections: 128,
			},
			policy,
			usage,
			authority,
			metrics,
		)
		.unwrap();
		(Arc::new(inputs), root_pem.into_bytes(), dir)
	}

	fn get(host: &str, path: &str) -> Request<Full<Bytes>> {
		Request::builder()
			.method(Method::GET)
			.uri(path)
			.header(header::HOST, host)
			.body(Full::new(Bytes::new()))
			.unwrap()
	}

	fn peer() -> SocketAddr {
		"10.0.0.50:40000".parse().unwrap()
	}

	async fn body_string(resp: Response<Body>) -> String {
		let collected = resp.into_body().collect().await.unwrap();
		String::from_utf8(collected.to_bytes().to_vec()).unwrap()
	}

	#[test]
	fn client_ip_prefers_forwarded_headers() {
		let mut headers = header::HeaderMap::new();
		assert_eq!(client_ip(&headers, peer()), "10.0.0.50".parse::<IpAddr>().unwrap());

		headers.insert("x-real-ip", "10.0.0.60".parse::<IpAddr>().unwrap().to_string().parse().unwrap());
		assert_eq!(client_ip(&headers, peer()), "10.0.0.60".parse::<IpAddr>().unwrap());

		headers.insert(
			"x-forwarded-for",
			"not-an-ip, 10.0.0.70, 10.0.0.71".parse().unwrap(),
		);
		assert_eq!(client_ip(&headers, peer()), "10.0.0.70".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn hop_by_hop_headers_are_stripped() {
		let mut headers = header::HeaderMap::new();
		headers.insert(header::CONNECTION, "keep-alive, x-session-token".parse().unwrap());
		headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
		headers.insert(header::UPGRADE, "websocket".parse().unwrap());
		headers.insert("x-session-token", "abc".parse().unwrap());
		headers.insert(header::ACCEPT, "*/*".parse().unwrap());
		headers.insert(header::HOST, "example.com".parse().unwrap());
		strip_hop_by_hop(&mut headers);
		assert!(headers.get(header::CONNECTION).is_none());
		assert!(headers.get(header::TRANSFER_ENCODING).is_none());
		assert!(headers.get(header::UPGRADE).is_none());
		assert!(headers.get("x-session-token").is_none());
		assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
		assert_eq!(headers.get(header::HOST).unwrap(), "example.com");
	}

	#[test]
	fn port_stripping() {
		assert_eq!(strip_port("example.com:8443"), "example.com");
		assert_eq!(strip_port("example.com"), "example.com");
		assert_eq!(strip_port("[::1]:443"), "[::1]");
		assert_eq!(strip_port("[::1]"), "[::1]");
	}

	#[tokio::test]
	async fn blocked_request_renders_block_page() {
		let (inputs, _, _dir) = test_inputs(
			vec![RawRuleInput {
				id: "no-ads".to_string(),
				hosts: vec!["ads.example.com".to_string()],
				clients: Vec::new(),
				action: Action::Block,
				reason: Some("advertising".to_string()),
				category: "ads".to_string(),
			}],
			HashMap::new(),
		);
		let resp = handle(
			inputs.clone(),
			get("ads.example.com", "/banner"),
			peer(),
			true,
			Some("ads.example.com".to_string()),
		)
		.await;
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"text/html; charset=utf-8"
		);
		let body = body_string(resp).await;
		assert!(body.contains("advertising"));
		assert!(body.contains("https://ads.example.com/banner"));
		assert!(body.contains("10.0.0.50"));
		assert_eq!(
			inputs
				.metrics
				.blocked_requests
				.get_or_create(&BlockedLabels {
					device: "10.0.0.50".to_string(),
					reason: "advertising".to_string(),
				})
				.get(),
			1
		);
	}

	#[tokio::test]
	async fn http_operator_host_redirects_to_https() {
		let (inputs, _, _dir) = test_inputs(Vec::new(), HashMap::new());
		let resp = handle(inputs, get("kproxy.lan", "/setup"), peer(), false, None).await;
		assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
		assert_eq!(
			resp.headers().get(header::LOCATION).unwrap(),
			"https://kproxy.lan/setup"
		);
	}

	#[tokio::test]
	async fn ca_cert_round_trips_byte_for_byte() {
		let (inputs, root_pem, _dir) = test_inputs(Vec::new(), HashMap::new());
		let resp = handle(inputs, get("kproxy.lan:443", "/ca.crt"), peer(), true, None).await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"application/x-x509-ca-cert"
		);
		assert_eq!(
			resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
			"attachment; filename=kproxy-root-ca.crt"
		);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body.as_ref(), root_pem.as_slice());
	}

	#[tokio::test]
	async fn setup_page_served_on_operator_host() {
		let (inputs, _, _dir) = test_inputs(Vec::new(), HashMap::new());
		let resp = handle(inputs, get("kproxy.lan", "/"), peer(), true, None).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = body_string(resp).await;
		assert!(body.contains("/ca.crt"));
	}

	#[tokio::test]
	async fn logo_short_circuits_on_any_host() {
		let (inputs, _, _dir) = test_inputs(Vec::new(), HashMap::new());
		let resp = handle(
			inputs,
			get("whatever.example", "/.kproxy/logo.png"),
			peer(),
			false,
			None,
		)
		.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");
	}

	#[tokio::test]
	async fn exhausted_limit_blocks_with_limit_reason() {
		// A zero cap is exceeded the moment the day's total is compared, so
		// the limit branch triggers without needing hours of seeded activity.
		let (inputs, _, _dir) = test_inputs(
			vec![RawRuleInput {
				id: "gaming".to_string(),
				hosts: vec!["**.game.example".to_string()],
				clients: Vec::new(),
				action: Action::Allow,
				reason: None,
				category: "gaming".to_string(),
			}],
			HashMap::from([("gaming".to_string(), 0)]),
		);
		let resp = handle(
			inputs,
			get("play.game.example", "/"),
			peer(),
			true,
			None,
		)
		.await;
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
		let body = body_string(resp).await;
		assert!(body.contains("Daily time limit"));
		assert!(body.contains("gaming"));
	}

	#[tokio::test]
	async fn unknown_host_with_missing_header_is_rejected() {
		let (inputs, _, _dir) = test_inputs(Vec::new(), HashMap::new());
		let req = Request::builder()
			.method(Method::GET)
			.uri("/")
			.body(Full::new(Bytes::new()))
			.unwrap();
		let resp = handle(inputs, req, peer(), false, None).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}
}
