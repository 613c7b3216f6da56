//! The local certificate authority.
//!
//! Leaves are minted on demand for whatever SNI a client presents, signed by
//! an operator-installed intermediate. The root key never enters the
//! process; only the root *certificate* is held, so it can be served to
//! clients for installation. Minted leaves live in a bounded LRU keyed by
//! lowercased SNI, and concurrent handshakes for one name coalesce into a
//! single minting operation.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
	KeyUsagePurpose, SerialNumber,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, error};

use crate::config::TlsConfig;
use crate::telemetry::Metrics;

/// Cached leaves within this much of expiry are re-minted instead of served.
const RENEWAL_SLACK: Duration = Duration::from_secs(5 * 60);
/// Leaves are backdated slightly so clients with skewed clocks accept them.
const BACKDATE: time::Duration = time::Duration::minutes(5);

#[derive(Debug, thiserror::Error)]
pub enum CaError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("no certificate found in {0}")]
	NoCertificate(PathBuf),
	#[error("no private key found in {0}")]
	NoPrivateKey(PathBuf),
	#[error("certificate generation: {0}")]
	Rcgen(#[from] rcgen::Error),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
}

struct CachedCert {
	key: Arc<CertifiedKey>,
	not_after: SystemTime,
	created: Instant,
}

/// Insertion-ordered LRU; reads promote, inserts evict the oldest entry.
struct CertCache {
	capacity: usize,
	map: HashMap<String, CachedCert>,
	order: VecDeque<String>,
}

impl CertCache {
	fn new(capacity: usize) -> CertCache {
		CertCache {
			capacity: capacity.max(1),
			map: HashMap::new(),
			order: VecDeque::new(),
		}
	}

	fn get(&mut self, key: &str) -> Option<&CachedCert> {
		if self.map.contains_key(key) {
			self.promote(key);
		}
		self.map.get(key)
	}

	fn insert(&mut self, key: String, cert: CachedCert) {
		self.map.insert(key.clone(), cert);
		self.promote(&key);
		while self.order.len() > self.capacity {
			if let Some(oldest) = self.order.pop_front() {
				self.map.remove(&oldest);
			}
		}
	}

	fn remove(&mut self, key: &str) {
		self.map.remove(key);
		if let Some(pos) = self.order.iter().position(|k| k == key) {
			self.order.remove(pos);
		}
	}

	fn promote(&mut self, key: &str) {
		if let Some(pos) = self.order.iter().position(|k| k == key) {
			self.order.remove(pos);
		}
		self.order.push_back(key.to_string());
	}
}

pub struct Authority {
	issuer: Issuer<'static, KeyPair>,
	intermediate_der: CertificateDer<'static>,
	root_pem: Vec<u8>,
	operator_hostname: String,
	operator_cert: Option<Arc<CertifiedKey>>,
	validity: Duration,
	cache_ttl: Duration,
	cache: Mutex<CertCache>,
	inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
	metrics: Arc<Metrics>,
}

impl Authority {
	/// Load CA material from disk. Missing or unparsable material is fatal.
	pub fn load(
		cfg: &TlsConfig,
		operator_hostname: &str,
		metrics: Arc<Metrics>,
	) -> Result<Authority, CaError> {
		let root_pem = read(&cfg.ca_cert)?;
		// The root must at least parse, since we hand it to clients.
		first_cert_der(&root_pem, &cfg.ca_cert)?;

		let intermediate_pem = read(&cfg.intermediate_cert)?;
		let intermediate_der = first_cert_der(&intermediate_pem, &cfg.intermediate_cert)?;
		let key_pem = String::from_utf8(read(&cfg.intermediate_key)?)
			.map_err(|_| CaError::NoPrivateKey(cfg.intermediate_key.clone()))?;
		let key = KeyPair::from_pem(&key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(
			std::str::from_utf8(&intermediate_pem)
				.map_err(|_| CaError::NoCertificate(cfg.intermediate_cert.clone()))?,
			key,
		)?;

		let operator_cert = match (&cfg.operator_cert, &cfg.operator_key) {
			(Some(cert), Some(key)) => Some(load_certified_key(cert, key)?),
			_ => None,
		};

		Ok(Authority {
			issuer,
			intermediate_der,
			root_pem,
			operator_hostname: operator_hostname.to_ascii_lowercase(),
			operator_cert,
			validity: cfg.cert_validity,
			cache_ttl: cfg.cert_cache_ttl,
			cache: Mutex::new(CertCache::new(cfg.cert_cache_size)),
			inflight: Mutex::new(HashMap::new()),
			metrics,
		})
	}

	/// The exact PEM bytes loaded at startup, served at `/ca.crt`.
	pub fn root_ca_pem(&self) -> &[u8] {
		&self.root_pem
	}

	/// The certificate to present for one SNI, minting if necessary.
	pub fn certified_key_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CaError> {
		let name = server_name.trim_end_matches('.').to_ascii_lowercase();
		if name == self.operator_hostname {
			if let Some(op) = &self.operator_cert {
				return Ok(op.clone());
			}
		}

		if let Some(key) = self.cached(&name) {
			self.metrics.certificate_cache_hits.inc();
			return Ok(key);
		}

		// Single flight: one gate per name; whoever holds it first mints,
		// later holders find the cache populated.
		let gate = {
			let mut inflight = self.inflight.lock();
			inflight
				.entry(name.clone())
				.or_insert_with(|| Arc::new(Mutex::new(())))
				.clone()
		};
		let _guard = gate.lock();

		if let Some(key) = self.cached(&name) {
			self.metrics.certificate_cache_hits.inc();
			return Ok(key);
		}
		self.metrics.certificate_cache_misses.inc();

		let result = self.mint(&name);
		if let Ok(cached) = &result {
			self.metrics.certificates_generated.inc();
			self.cache.lock().insert(
				name.clone(),
				CachedCert {
					key: cached.clone(),
					not_after: SystemTime::now() + self.validity,
					created: Instant::now(),
				},
			);
		}
		self.inflight.lock().remove(&name);
		result
	}

	fn cached(&self, name: &str) -> Option<Arc<CertifiedKey>> {
		let mut cache = self.cache.lock();
		let entry = cache.get(name)?;
		let fresh = entry.created.elapsed() < self.cache_ttl
			&& entry
				.not_after
				.duration_since(SystemTime::now())
				.is_ok_and(|left| left > RENEWAL_SLACK);
		if fresh {
			Some(entry.key.clone())
		} else {
			cache.remove(name);
			None
		}
	}

	fn mint(&self, name: &str) -> Result<Arc<CertifiedKey>, CaError> {
		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

		let mut params = CertificateParams::new(vec![name.to_string()])?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, name);
		params.distinguished_name = dn;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

		let mut serial = rand::random::<[u8; 16]>();
		// Keep the DER integer positive.
		serial[0] &= 0x7f;
		params.serial_number = Some(SerialNumber::from(serial.to_vec()));

		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - BACKDATE;
		params.not_after = now
			+ time::Duration::try_from(self.validity).unwrap_or(time::Duration::hours(24));

		let cert = params.signed_by(&leaf_key, &self.issuer)?;
		let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(
			&PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
		)?;
		debug!(host = name, "minted leaf certificate");
		Ok(Arc::new(CertifiedKey::new(
			vec![cert.der().clone(), self.intermediate_der.clone()],
			signing_key,
		)))
	}
}

fn read(path: &Path) -> Result<Vec<u8>, CaError> {
	std::fs::read(path).map_err(|source| CaError::Read {
		path: path.to_path_buf(),
		source,
	})
}

fn first_cert_der(pem: &[u8], path: &Path) -> Result<CertificateDer<'static>, CaError> {
	let mut reader = std::io::BufReader::new(pem);
	rustls_pemfile::certs(&mut reader)
		.next()
		.and_then(|c| c.ok())
		.ok_or_else(|| CaError::NoCertificate(path.to_path_buf()))
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, CaError> {
	let cert_pem = read(cert_path)?;
	let mut reader = std::io::BufReader::new(cert_pem.as_slice());
	let chain = rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|_| CaError::NoCertificate(cert_path.to_path_buf()))?;
	if chain.is_empty() {
		return Err(CaError::NoCertificate(cert_path.to_path_buf()));
	}
	let key_pem = read(key_path)?;
	let mut reader = std::io::BufReader::new(key_pem.as_slice());
	let key = rustls_pemfile::private_key(&mut reader)
		.ok()
		.flatten()
		.ok_or_else(|| CaError::NoPrivateKey(key_path.to_path_buf()))?;
	let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;
	Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// SNI-driven certificate selection for the TLS listener.
pub struct CertResolver(pub Arc<Authority>);

impl std::fmt::Debug for CertResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertResolver").finish_non_exhaustive()
	}
}

impl ResolvesServerCert for CertResolver {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		let name = client_hello.server_name()?;
		match self.0.certified_key_for(name) {
			Ok(key) => Some(key),
			Err(e) => {
				// Returning None fails the handshake with an internal error.
				error!(host = name, error = %e, "failed to produce certificate");
				None
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::TlsConfig;

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

	fn test_authority() -> (Authority, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let (root_pem, _) = self_signed_ca("KProxy Test Root");
		let (int_pem, int_key_pem) = self_signed_ca("KProxy Test Intermediate");
		let ca_cert = dir.path().join("ca.crt");
		let int_cert = dir.path().join("intermediate.crt");
		let int_key = dir.path().join("intermediate.key");
		std::fs::write(&ca_cert, &root_pem).unwrap();
		std::fs::write(&int_cert, &int_pem).unwrap();
		std::fs::write(&int_key, &int_key_pem).unwrap();
		let cfg = TlsConfig {
			ca_cert,
			intermediate_cert: int_cert,
			intermediate_key: int_key,
			..TlsConfig::default()
		};
		let authority =
			Authority::load(&cfg, "kproxy.lan", Arc::new(Metrics::unregistered())).unwrap();
		(authority, dir)
	}

	#[test]
	fn missing_material_is_fatal() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = TlsConfig {
			ca_cert: dir.path().join("nope.crt"),
			..TlsConfig::default()
		};
		assert!(matches!(
			Authority::load(&cfg, "kproxy.lan", Arc::new(Metrics::unregistered())),
			Err(CaError::Read { .. })
		));
	}

	#[test]
	fn mints_leaf_with_sni_san() {
		let (authority, _dir) = test_authority();
		let key = authority.certified_key_for("Foo.Example.").unwrap();
		assert_eq!(key.cert.len(), 2);

		let (_, leaf) = x509_parser::parse_x509_certificate(key.cert[0].as_ref()).unwrap();
		let sans: Vec<String> = leaf
			.subject_alternative_name()
			.unwrap()
			.unwrap()
			.value
			.general_names
			.iter()
			.filter_map(|n| match n {
				x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
				_ => None,
			})
			.collect();
		assert_eq!(sans, vec!["foo.example".to_string()]);
		assert!(
			leaf
				.issuer()
				.to_string()
				.contains("KProxy Test Intermediate")
		);
		assert!(leaf.validity().is_valid());
	}

	#[test]
	fn repeated_requests_hit_the_cache() {
		let (authority, _dir) = test_authority();
		let a = authority.certified_key_for("foo.example").unwrap();
		let b = authority.certified_key_for("FOO.example").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(authority.metrics.certificates_generated.get(), 1);
		assert_eq!(authority.metrics.certificate_cache_hits.get(), 1);
	}

	#[test]
	fn concurrent_handshakes_mint_once() {
		let (authority, _dir) = test_authority();
		let authority = Arc::new(authority);
		let handles: Vec<_> = (0..16)
			.map(|_| {
				let authority = authority.clone();
				std::thread::spawn(move || authority.certified_key_for("bar.example").unwrap())
			})
			.collect();
		let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		assert_eq!(authority.metrics.certificates_generated.get(), 1);
		for k in &keys[1..] {
			assert!(Arc::ptr_eq(&keys[0], k));
		}
	}

	#[test]
	fn eviction_respects_capacity() {
		let mut cache = CertCache::new(2);
		let dummy = || CachedCert {
			key: Arc::new(CertifiedKey::new(
				Vec::new(),
				rustls::crypto::aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
					PrivatePkcs8KeyDer::from(
						KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
							.unwrap()
							.serialize_der(),
					),
				))
				.unwrap(),
			)),
			not_after: SystemTime::now() + Duration::from_secs(3600),
			created: Instant::now(),
		};
		cache.insert("a".to_string(), dummy());
		cache.insert("b".to_string(), dummy());
		// Touch "a" so "b" is the LRU victim.
		cache.get("a");
		cache.insert("c".to_string(), dummy());
		assert!(cache.get("a").is_some());
		assert!(cache.get("b").is_none());
		assert!(cache.get("c").is_some());
	}

	#[test]
	fn root_pem_round_trips() {
		let (authority, dir) = test_authority();
		let on_disk = std::fs::read(dir.path().join("ca.crt")).unwrap();
		assert_eq!(authority.root_ca_pem(), on_disk.as_slice());
	}
}
