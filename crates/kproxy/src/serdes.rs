use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Parse a duration from either a bare number of seconds or a Go-style
/// duration string (`"500ms"`, `"30s"`, `"2m"`, `"24h"`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
	if let Ok(secs) = s.parse::<u64>() {
		return Ok(Duration::from_secs(secs));
	}
	match go_parse_duration::parse_duration(s) {
		Ok(nanos) if nanos >= 0 => Ok(Duration::from_nanos(nanos as u64)),
		Ok(_) => Err(format!("negative duration: {s}")),
		Err(_) => Err(format!("invalid duration: {s}")),
	}
}

fn format_duration(d: &Duration) -> String {
	if d.subsec_nanos() == 0 {
		format!("{}s", d.as_secs())
	} else {
		format!("{}ms", d.as_millis())
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
	Seconds(u64),
	Text(String),
}

impl DurationRepr {
	fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
		match self {
			DurationRepr::Seconds(s) => Ok(Duration::from_secs(s)),
			DurationRepr::Text(s) => parse_duration(&s).map_err(E::custom),
		}
	}
}

pub mod serde_dur {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&format_duration(d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		DurationRepr::deserialize(d)?.into_duration()
	}
}

pub mod serde_dur_option {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&format_duration(d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let repr: Option<DurationRepr> = Option::deserialize(d)?;
		repr.map(DurationRepr::into_duration).transpose()
	}
}

/// Parse a `HH:MM` wall-clock time into (hour, minute).
pub fn parse_clock_time(s: &str) -> Result<(u32, u32), String> {
	let (h, m) = s
		.split_once(':')
		.ok_or_else(|| format!("invalid time of day: {s}"))?;
	let hour: u32 = h.parse().map_err(|_| format!("invalid hour: {s}"))?;
	let minute: u32 = m.parse().map_err(|_| format!("invalid minute: {s}"))?;
	if hour > 23 || minute > 59 {
		return Err(format!("time of day out of range: {s}"));
	}
	Ok((hour, minute))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn durations() {
		assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
		assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
		assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
		assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
		assert_eq!(
			parse_duration("500ms").unwrap(),
			Duration::from_millis(500)
		);
		assert!(parse_duration("soon").is_err());
	}

	#[test]
	fn clock_times() {
		assert_eq!(parse_clock_time("00:00").unwrap(), (0, 0));
		assert_eq!(parse_clock_time("21:30").unwrap(), (21, 30));
		assert!(parse_clock_time("24:00").is_err());
		assert!(parse_clock_time("midnight").is_err());
	}
}
