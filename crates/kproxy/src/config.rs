use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serdes::{self, serde_dur};

/// Usage rows and daily indexes are kept this long, then purged.
pub const USAGE_RETENTION_DAYS: u32 = 90;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid environment override {key}: {message}")]
	Env { key: String, message: String },
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub dns: DnsConfig,
	#[serde(default)]
	pub tls: TlsConfig,
	#[serde(default)]
	pub usage_tracking: UsageConfig,
	#[serde(default)]
	pub policy: PolicyConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
	pub dns_port: u16,
	pub http_port: u16,
	pub https_port: u16,
	pub bind_address: IpAddr,
	/// The address handed out for intercepted DNS A queries. Clients must be
	/// able to reach the proxy listeners on it.
	pub proxy_ip: Ipv4Addr,
	/// DNS name under which the setup page and root certificate are served.
	pub operator_hostname: String,
	/// Resolve client MACs through the kernel ARP table.
	pub resolve_mac: bool,
	/// Per-listener cap on concurrently served connections.
	pub max_connections: usize,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			dns_port: 53,
			http_port: 80,
			https_port: 443,
			bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			proxy_ip: Ipv4Addr::UNSPECIFIED,
			operator_hostname: "kproxy.lan".to_string(),
			resolve_mac: true,
			max_connections: 4096,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DnsConfig {
	pub udp_enabled: bool,
	pub tcp_enabled: bool,
	/// Ordered `host:port` upstream resolvers.
	pub upstream_servers: Vec<String>,
	#[serde(with = "serde_dur")]
	pub intercept_ttl: Duration,
	#[serde(with = "serde_dur")]
	pub bypass_ttl_cap: Duration,
	#[serde(with = "serde_dur")]
	pub block_ttl: Duration,
	#[serde(with = "serde_dur")]
	pub upstream_timeout: Duration,
	/// Wildcard patterns that always bypass interception (`*` matches one
	/// label, `**` one or more).
	pub global_bypass: Vec<String>,
}

impl Default for DnsConfig {
	fn default() -> Self {
		DnsConfig {
			udp_enabled: true,
			tcp_enabled: true,
			upstream_servers: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
			intercept_ttl: Duration::from_secs(60),
			bypass_ttl_cap: Duration::from_secs(300),
			block_ttl: Duration::from_secs(60),
			upstream_timeout: Duration::from_secs(5),
			global_bypass: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TlsConfig {
	/// Root CA certificate, served to clients for installation.
	pub ca_cert: PathBuf,
	/// Root CA key path. Present for operator tooling only; the proxy never
	/// reads it.
	pub ca_key: Option<PathBuf>,
	pub intermediate_cert: PathBuf,
	pub intermediate_key: PathBuf,
	/// Operator-provided (e.g. ACME) certificate presented for the operator
	/// hostname instead of a minted leaf.
	pub operator_cert: Option<PathBuf>,
	pub operator_key: Option<PathBuf>,
	pub cert_cache_size: usize,
	#[serde(with = "serde_dur")]
	pub cert_cache_ttl: Duration,
	#[serde(with = "serde_dur")]
	pub cert_validity: Duration,
}

impl Default for TlsConfig {
	fn default() -> Self {
		TlsConfig {
			ca_cert: PathBuf::from("/etc/kproxy/ca.crt"),
			ca_key: None,
			intermediate_cert: PathBuf::from("/etc/kproxy/intermediate.crt"),
			intermediate_key: PathBuf::from("/etc/kproxy/intermediate.key"),
			operator_cert: None,
			operator_key: None,
			cert_cache_size: 1000,
			cert_cache_ttl: Duration::from_secs(12 * 3600),
			cert_validity: Duration::from_secs(24 * 3600),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UsageConfig {
	#[serde(with = "serde_dur")]
	pub inactivity_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub min_session_duration: Duration,
	/// `HH:MM` wall-clock time of the daily rollover.
	pub daily_reset_time: String,
	/// Fixed UTC offset the daily rollover is evaluated in, e.g. `+02:00`.
	pub timezone: String,
}

impl Default for UsageConfig {
	fn default() -> Self {
		UsageConfig {
			inactivity_timeout: Duration::from_secs(120),
			min_session_duration: Duration::from_secs(10),
			daily_reset_time: "00:00".to_string(),
			timezone: "+00:00".to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
	#[default]
	Allow,
	Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
	/// Local rule file. Mutually exclusive with `remote_url`.
	pub rules_file: Option<PathBuf>,
	/// Decision-service endpoint evaluated per request.
	pub remote_url: Option<String>,
	#[serde(with = "serde_dur")]
	pub remote_timeout: Duration,
	pub remote_retries: u32,
	/// Applied when evaluation itself fails.
	pub default_action: DefaultAction,
	/// Daily per-device caps in seconds, keyed by decision category.
	pub limits: HashMap<String, u64>,
}

impl Default for PolicyConfig {
	fn default() -> Self {
		PolicyConfig {
			rules_file: None,
			remote_url: None,
			remote_timeout: Duration::from_secs(30),
			remote_retries: 3,
			default_action: DefaultAction::Allow,
			limits: HashMap::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
	pub level: String,
	pub format: LogFormat,
	/// Advisory retention for shipped request logs; enforced by whatever
	/// collects them, not by the proxy.
	pub request_log_retention_days: u32,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfig {
			level: "info".to_string(),
			format: LogFormat::Text,
			request_log_retention_days: 30,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
	#[default]
	Memory,
	Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
	pub backend: StorageBackend,
	pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MetricsConfig {
	pub enabled: bool,
	pub bind_address: String,
}

impl Default for MetricsConfig {
	fn default() -> Self {
		MetricsConfig {
			enabled: true,
			bind_address: "127.0.0.1:9090".to_string(),
		}
	}
}

impl Config {
	/// Load from a YAML file (or defaults when absent), apply `KPROXY_`
	/// environment overrides, then validate.
	pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
		let mut cfg = match path {
			Some(p) => {
				let contents = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
					path: p.to_path_buf(),
					source,
				})?;
				serde_yaml::from_str(&contents)?
			},
			None => Config::default(),
		};
		cfg.apply_env()?;
		cfg.validate()?;
		Ok(cfg)
	}

	/// Apply `KPROXY_`-prefixed environment overrides. Dots in the config key
	/// map to underscores: `server.http_port` becomes `KPROXY_SERVER_HTTP_PORT`.
	pub fn apply_env(&mut self) -> Result<(), ConfigError> {
		override_parsed("server.dns_port", &mut self.server.dns_port)?;
		override_parsed("server.http_port", &mut self.server.http_port)?;
		override_parsed("server.https_port", &mut self.server.https_port)?;
		override_parsed("server.bind_address", &mut self.server.bind_address)?;
		override_parsed("server.proxy_ip", &mut self.server.proxy_ip)?;
		override_parsed(
			"server.operator_hostname",
			&mut self.server.operator_hostname,
		)?;
		override_parsed("server.resolve_mac", &mut self.server.resolve_mac)?;
		override_parsed("server.max_connections", &mut self.server.max_connections)?;

		override_parsed("dns.udp_enabled", &mut self.dns.udp_enabled)?;
		override_parsed("dns.tcp_enabled", &mut self.dns.tcp_enabled)?;
		override_list("dns.upstream_servers", &mut self.dns.upstream_servers)?;
		override_duration("dns.intercept_ttl", &mut self.dns.intercept_ttl)?;
		override_duration("dns.bypass_ttl_cap", &mut self.dns.bypass_ttl_cap)?;
		override_duration("dns.block_ttl", &mut self.dns.block_ttl)?;
		override_duration("dns.upstream_timeout", &mut self.dns.upstream_timeout)?;
		override_list("dns.global_bypass", &mut self.dns.global_bypass)?;

		override_parsed("tls.ca_cert", &mut self.tls.ca_cert)?;
		override_parsed("tls.intermediate_cert", &mut self.tls.intermediate_cert)?;
		override_parsed("tls.intermediate_key", &mut self.tls.intermediate_key)?;
		override_parsed("tls.cert_cache_size", &mut self.tls.cert_cache_size)?;
		override_duration("tls.cert_cache_ttl", &mut self.tls.cert_cache_ttl)?;
		override_duration("tls.cert_validity", &mut self.tls.cert_validity)?;

		override_duration(
			"usage_tracking.inactivity_timeout",
			&mut self.usage_tracking.inactivity_timeout,
		)?;
		override_duration(
			"usage_tracking.min_session_duration",
			&mut self.usage_tracking.min_session_duration,
		)?;
		override_parsed(
			"usage_tracking.daily_reset_time",
			&mut self.usage_tracking.daily_reset_time,
		)?;
		override_parsed("usage_tracking.timezone", &mut self.usage_tracking.timezone)?;

		override_parsed("policy.remote_url", &mut self.policy.remote_url)?;
		override_parsed("policy.remote_retries", &mut self.policy.remote_retries)?;
		override_duration("policy.remote_timeout", &mut self.policy.remote_timeout)?;
		if let Some(v) = env_var("policy.default_action") {
			self.policy.default_action = match v.as_str() {
				"allow" => DefaultAction::Allow,
				"block" => DefaultAction::Block,
				other => {
					return Err(ConfigError::Env {
						key: env_key("policy.default_action"),
						message: format!("unknown action {other:?}"),
					});
				},
			};
		}

		override_parsed("logging.level", &mut self.logging.level)?;
		if let Some(v) = env_var("logging.format") {
			self.logging.format = match v.as_str() {
				"text" => LogFormat::Text,
				"json" => LogFormat::Json,
				other => {
					return Err(ConfigError::Env {
						key: env_key("logging.format"),
						message: format!("unknown format {other:?}"),
					});
				},
			};
		}

		override_parsed("storage.redis_url", &mut self.storage.redis_url)?;
		if let Some(v) = env_var("storage.backend") {
			self.storage.backend = match v.as_str() {
				"memory" => StorageBackend::Memory,
				"redis" => StorageBackend::Redis,
				other => {
					return Err(ConfigError::Env {
						key: env_key("storage.backend"),
						message: format!("unknown backend {other:?}"),
					});
				},
			};
		}

		override_parsed("metrics.enabled", &mut self.metrics.enabled)?;
		override_parsed("metrics.bind_address", &mut self.metrics.bind_address)?;
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.dns.intercept_ttl > self.dns.bypass_ttl_cap {
			return Err(ConfigError::Invalid(format!(
				"dns.intercept_ttl ({:?}) must not exceed dns.bypass_ttl_cap ({:?})",
				self.dns.intercept_ttl, self.dns.bypass_ttl_cap
			)));
		}
		if self.server.proxy_ip.is_unspecified() {
			return Err(ConfigError::Invalid(
				"server.proxy_ip must be set to a reachable address".to_string(),
			));
		}
		if (self.dns.udp_enabled || self.dns.tcp_enabled) && self.dns.upstream_servers.is_empty() {
			return Err(ConfigError::Invalid(
				"dns.upstream_servers must not be empty while DNS is enabled".to_string(),
			));
		}
		if self.server.operator_hostname.is_empty() {
			return Err(ConfigError::Invalid(
				"server.operator_hostname must not be empty".to_string(),
			));
		}
		if self.policy.rules_file.is_some() && self.policy.remote_url.is_some() {
			return Err(ConfigError::Invalid(
				"policy.rules_file and policy.remote_url are mutually exclusive".to_string(),
			));
		}
		if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
			return Err(ConfigError::Invalid(
				"storage.redis_url is required for the redis backend".to_string(),
			));
		}
		serdes::parse_clock_time(&self.usage_tracking.daily_reset_time)
			.map_err(ConfigError::Invalid)?;
		crate::usage::parse_tz_offset(&self.usage_tracking.timezone)
			.ok_or_else(|| {
				ConfigError::Invalid(format!(
					"usage_tracking.timezone {:?} is not a +HH:MM offset",
					self.usage_tracking.timezone
				))
			})?;
		Ok(())
	}
}

fn env_key(key: &str) -> String {
	format!("KPROXY_{}", key.replace('.', "_").to_ascii_uppercase())
}

fn env_var(key: &str) -> Option<String> {
	env::var(env_key(key)).ok().filter(|v| !v.is_empty())
}

fn override_parsed<T: FromStrField>(key: &str, target: &mut T) -> Result<(), ConfigError> {
	if let Some(v) = env_var(key) {
		*target = T::parse_field(&v).map_err(|message| ConfigError::Env {
			key: env_key(key),
			message,
		})?;
	}
	Ok(())
}

fn override_duration(key: &str, target: &mut Duration) -> Result<(), ConfigError> {
	if let Some(v) = env_var(key) {
		*target = serdes::parse_duration(&v).map_err(|message| ConfigError::Env {
			key: env_key(key),
			message,
		})?;
	}
	Ok(())
}

fn override_list(key: &str, target: &mut Vec<String>) -> Result<(), ConfigError> {
	if let Some(v) = env_var(key) {
		*target = v
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
	}
	Ok(())
}

/// `FromStr` with a uniform error message, plus the odd non-`FromStr` targets
/// the override table needs.
trait FromStrField: Sized {
	fn parse_field(s: &str) -> Result<Self, String>;
}

impl FromStrField for String {
	fn parse_field(s: &str) -> Result<Self, String> {
		Ok(s.to_string())
	}
}

impl FromStrField for Option<String> {
	fn parse_field(s: &str) -> Result<Self, String> {
		Ok(Some(s.to_string()))
	}
}

impl FromStrField for PathBuf {
	fn parse_field(s: &str) -> Result<Self, String> {
		Ok(PathBuf::from(s))
	}
}

impl FromStrField for bool {
	fn parse_field(s: &str) -> Result<Self, String> {
		match s {
			"true" | "1" | "yes" => Ok(true),
			"false" | "0" | "no" => Ok(false),
			_ => Err(format!("expected boolean, got {s:?}")),
		}
	}
}

macro_rules! from_str_field {
	($($t:ty),*) => {
		$(impl FromStrField for $t {
			fn parse_field(s: &str) -> Result<Self, String> {
				s.parse().map_err(|e| format!("{e}"))
			}
		})*
	};
}

from_str_field!(u16, u32, usize, IpAddr, Ipv4Addr);

#[cfg(test)]
mod tests {
	use super::*;

	fn valid_yaml() -> &'static str {
		r#"
server:
  proxy_ip: 10.0.0.1
  operator_hostname: proxy.home
dns:
  upstream_servers: ["9.9.9.9:53"]
  intercept_ttl: 60s
  bypass_ttl_cap: 5m
policy:
  limits:
    gaming: 3600
"#
	}

	#[test]
	fn parses_full_schema() {
		let cfg: Config = serde_yaml::from_str(valid_yaml()).unwrap();
		assert_eq!(cfg.server.proxy_ip, Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(cfg.dns.intercept_ttl, Duration::from_secs(60));
		assert_eq!(cfg.dns.bypass_ttl_cap, Duration::from_secs(300));
		assert_eq!(cfg.policy.limits.get("gaming"), Some(&3600));
		cfg.validate().unwrap();
	}

	#[test]
	fn rejects_ttl_inversion() {
		let mut cfg: Config = serde_yaml::from_str(valid_yaml()).unwrap();
		cfg.dns.intercept_ttl = Duration::from_secs(600);
		let err = cfg.validate().unwrap_err();
		assert!(err.to_string().contains("bypass_ttl_cap"));
	}

	#[test]
	fn rejects_unset_proxy_ip() {
		let cfg = Config::default();
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn env_override_wins() {
		let mut cfg: Config = serde_yaml::from_str(valid_yaml()).unwrap();
		// Serialized access: env mutation is process-global.
		unsafe {
			env::set_var("KPROXY_SERVER_HTTP_PORT", "8080");
			env::set_var("KPROXY_DNS_UPSTREAM_SERVERS", "1.1.1.1:53, 9.9.9.9:53");
		}
		cfg.apply_env().unwrap();
		unsafe {
			env::remove_var("KPROXY_SERVER_HTTP_PORT");
			env::remove_var("KPROXY_DNS_UPSTREAM_SERVERS");
		}
		assert_eq!(cfg.server.http_port, 8080);
		assert_eq!(
			cfg.dns.upstream_servers,
			vec!["1.1.1.1:53".to_string(), "9.9.9.9:53".to_string()]
		);
	}

	#[test]
	fn rejects_bad_timezone() {
		let mut cfg: Config = serde_yaml::from_str(valid_yaml()).unwrap();
		cfg.usage_tracking.timezone = "Europe/Berlin".to_string();
		assert!(cfg.validate().is_err());
	}
}
