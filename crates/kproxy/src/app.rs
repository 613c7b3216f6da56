//! Wires the components together and owns their lifecycle.
//!
//! Startup order matters: storage and CA material are fatal when missing,
//! so they come first; listeners bind before anything is announced as
//! ready. Every server and background task hangs off one cancellation
//! token, and the first server error tears the whole process down the same
//! way a signal does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ca::Authority;
use crate::config::{Config, StorageBackend};
use crate::dns::DnsServer;
use crate::policy::{PolicyEngine, RemoteEngine, RuleSet, RuleSetHandle};
use crate::proxy::{self, ProxyInputs, ProxySettings};
use crate::store::{FallbackStore, MemoryStore, RedisStore, Store};
use crate::telemetry::{self, Metrics};
use crate::usage::UsageTracker;

/// How long draining connections get after cancellation.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let registry = Arc::new(registry);

	let store = open_store(&cfg).await?;
	let authority = Arc::new(
		Authority::load(&cfg.tls, &cfg.server.operator_hostname, metrics.clone())
			.context("loading CA material")?,
	);
	let usage = Arc::new(UsageTracker::new(
		&cfg.usage_tracking,
		store,
		metrics.clone(),
	));
	let policy = build_policy(&cfg)?;

	let proxy_inputs = Arc::new(
		ProxyInputs::new(
			ProxySettings {
				operator_hostname: cfg.server.operator_hostname.clone(),
				resolve_mac: cfg.server.resolve_mac,
				default_action: cfg.policy.default_action,
				limits: cfg.policy.limits.clone(),
				max_connections: cfg.server.max_connections,
			},
			policy.clone(),
			usage.clone(),
			authority.clone(),
			metrics.clone(),
		)
		.context("building upstream client")?,
	);

	let cancel = CancellationToken::new();
	let mut servers: JoinSet<anyhow::Result<()>> = JoinSet::new();

	if cfg.dns.udp_enabled || cfg.dns.tcp_enabled {
		let dns = Arc::new(
			DnsServer::new(
				&cfg.dns,
				cfg.server.proxy_ip,
				policy.clone(),
				cfg.policy.default_action,
				metrics.clone(),
			)
			.context("constructing DNS server")?,
		);
		if cfg.dns.udp_enabled {
			let socket = UdpSocket::bind((cfg.server.bind_address, cfg.server.dns_port))
				.await
				.context("binding dns/udp")?;
			servers.spawn(dns.clone().run_udp(Arc::new(socket), cancel.clone()));
		}
		if cfg.dns.tcp_enabled {
			let listener = TcpListener::bind((cfg.server.bind_address, cfg.server.dns_port))
				.await
				.context("binding dns/tcp")?;
			servers.spawn(dns.clone().run_tcp(listener, cancel.clone()));
		}
	}

	let http = TcpListener::bind((cfg.server.bind_address, cfg.server.http_port))
		.await
		.context("binding http")?;
	servers.spawn(proxy::run_http(proxy_inputs.clone(), http, cancel.clone()));

	let https = TcpListener::bind((cfg.server.bind_address, cfg.server.https_port))
		.await
		.context("binding https")?;
	servers.spawn(proxy::run_https(proxy_inputs.clone(), https, cancel.clone()));

	if cfg.metrics.enabled {
		let addr: SocketAddr = cfg
			.metrics
			.bind_address
			.parse()
			.context("metrics.bind_address")?;
		servers.spawn(telemetry::serve_metrics(addr, registry, cancel.clone()));
	}

	let mut background = JoinSet::new();
	background.spawn(usage.clone().run_sweeper(cancel.clone()));
	background.spawn(usage.clone().run_daily_reset(cancel.clone()));

	info!(
		proxy_ip = %cfg.server.proxy_ip,
		operator = cfg.server.operator_hostname,
		"kproxy ready"
	);

	tokio::select! {
		_ = shutdown_signal() => {
			info!("shutdown signal received");
		},
		res = servers.join_next() => {
			match res {
				Some(Ok(Ok(()))) => warn!("a server exited unexpectedly"),
				Some(Ok(Err(e))) => warn!(error = %e, "server failed"),
				Some(Err(e)) => warn!(error = %e, "server panicked"),
				None => {},
			}
		},
	}

	cancel.cancel();
	let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
	while let Ok(Some(res)) = tokio::time::timeout_at(deadline, servers.join_next()).await {
		if let Ok(Err(e)) = res {
			warn!(error = %e, "server error during drain");
		}
	}
	servers.abort_all();
	background.abort_all();

	let finalized = usage.finalize_all().await;
	info!(finalized, "final usage sessions folded in");
	Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
	Ok(match cfg.storage.backend {
		StorageBackend::Memory => Arc::new(MemoryStore::default()),
		StorageBackend::Redis => {
			let url = cfg
				.storage
				.redis_url
				.as_ref()
				.context("storage.redis_url missing")?;
			// Unreachable storage at startup is fatal; failures after this
			// point degrade to memory through the fallback wrapper.
			let redis = RedisStore::connect(url)
				.await
				.context("connecting to redis")?;
			Arc::new(FallbackStore::new(Arc::new(redis)))
		},
	})
}

fn build_policy(cfg: &Config) -> anyhow::Result<Arc<dyn PolicyEngine>> {
	let policy = &cfg.policy;
	Ok(if let Some(url) = &policy.remote_url {
		Arc::new(
			RemoteEngine::new(url.clone(), policy.remote_timeout, policy.remote_retries)
				.context("building decision-service client")?,
		)
	} else if let Some(path) = &policy.rules_file {
		Arc::new(
			RuleSetHandle::load_file(path, policy.default_action)
				.with_context(|| format!("loading rules from {}", path.display()))?,
		)
	} else {
		Arc::new(RuleSetHandle::new(RuleSet::empty(policy.default_action)))
	})
}

async fn shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("installing SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
