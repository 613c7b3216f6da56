pub mod log;
pub mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LogFormat, LoggingConfig};

pub use metrics::Metrics;

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_tracing(cfg: &LoggingConfig) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.level.clone()));
	match cfg.format {
		LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
		LogFormat::Json => tracing_subscriber::fmt()
			.json()
			.with_env_filter(filter)
			.init(),
	}
}

/// Serve the Prometheus text exposition until cancelled.
pub async fn serve_metrics(
	addr: SocketAddr,
	registry: Arc<Registry>,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "metrics listening");
	loop {
		let (stream, peer) = tokio::select! {
			res = listener.accept() => res?,
			_ = cancel.cancelled() => return Ok(()),
		};
		let registry = registry.clone();
		tokio::spawn(async move {
			let service = service_fn(move |_req| {
				let registry = registry.clone();
				async move {
					let mut body = String::new();
					prometheus_client::encoding::text::encode(&mut body, &registry)
						.expect("string encoding cannot fail");
					hyper::Response::builder()
						.header(
							hyper::header::CONTENT_TYPE,
							"application/openmetrics-text; version=1.0.0; charset=utf-8",
						)
						.body(Full::new(Bytes::from(body)))
				}
			});
			if let Err(e) = hyper::server::conn::http1::Builder::new()
				.serve_connection(TokioIo::new(stream), service)
				.await
			{
				debug!(%peer, error = %e, "metrics connection error");
			}
		});
	}
}
