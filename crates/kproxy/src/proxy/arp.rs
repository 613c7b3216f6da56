use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// How long one snapshot of the kernel ARP table is trusted.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// IP → MAC lookups backed by `/proc/net/arp`, refreshed lazily.
pub struct ArpCache {
	path: PathBuf,
	inner: Mutex<Snapshot>,
}

struct Snapshot {
	taken: Option<Instant>,
	entries: HashMap<IpAddr, String>,
}

impl ArpCache {
	pub fn new() -> ArpCache {
		ArpCache::with_path("/proc/net/arp".into())
	}

	pub fn with_path(path: PathBuf) -> ArpCache {
		ArpCache {
			path,
			inner: Mutex::new(Snapshot {
				taken: None,
				entries: HashMap::new(),
			}),
		}
	}

	pub fn lookup(&self, ip: IpAddr) -> Option<String> {
		let mut inner = self.inner.lock();
		let stale = inner
			.taken
			.is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL);
		if stale {
			inner.entries = self.read_table();
			inner.taken = Some(Instant::now());
		}
		inner.entries.get(&ip).cloned()
	}

	fn read_table(&self) -> HashMap<IpAddr, String> {
		let Ok(contents) = std::fs::read_to_string(&self.path) else {
			debug!(path = %self.path.display(), "arp table unavailable");
			return HashMap::new();
		};
		parse_arp_table(&contents)
	}
}

impl Default for ArpCache {
	fn default() -> Self {
		ArpCache::new()
	}
}

/// Parse the procfs ARP table: `IP HW-type Flags MAC Mask Device` per line,
/// header first. Incomplete entries (flags 0x0, all-zero MAC) are skipped.
fn parse_arp_table(contents: &str) -> HashMap<IpAddr, String> {
	let mut entries = HashMap::new();
	for line in contents.lines().skip(1) {
		let fields: Vec<&str> = line.split_whitespace().collect();
		let [ip, _, flags, mac, ..] = fields.as_slice() else {
			continue;
		};
		if *flags == "0x0" || *mac == "00:00:00:00:00:00" {
			continue;
		}
		if let Ok(ip) = ip.parse::<IpAddr>() {
			entries.insert(ip, mac.to_ascii_lowercase());
		}
	}
	entries
}

#[cfg(test)]
mod tests {
	use super::*;

	const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
10.0.0.50        0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
10.0.0.51        0x1         0x0         00:00:00:00:00:00     *        eth0
10.0.0.52        0x1         0x2         AA:11:22:33:44:55     *        eth0
";

	#[test]
	fn parses_complete_entries() {
		let entries = parse_arp_table(TABLE);
		assert_eq!(
			entries.get(&"10.0.0.50".parse::<IpAddr>().unwrap()),
			Some(&"aa:bb:cc:dd:ee:ff".to_string())
		);
		// Incomplete entry skipped.
		assert!(!entries.contains_key(&"10.0.0.51".parse::<IpAddr>().unwrap()));
		// MACs normalize to lowercase.
		assert_eq!(
			entries.get(&"10.0.0.52".parse::<IpAddr>().unwrap()),
			Some(&"aa:11:22:33:44:55".to_string())
		);
	}

	#[test]
	fn missing_table_is_empty() {
		let cache = ArpCache::with_path("/nonexistent/arp".into());
		assert_eq!(cache.lookup("10.0.0.50".parse().unwrap()), None);
	}
}
