//! Wildcard host patterns over dot-separated labels.
//!
//! Semantics are fixed rather than borrowed from any shell glob library:
//! `*` matches exactly one label, `**` matches one or more labels, every
//! other label is a case-insensitive literal. So `*.example.com` matches
//! `a.example.com` but neither `example.com` nor `a.b.example.com`, while
//! `**.example.com` matches both of the dotted forms.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
	Literal(String),
	One,
	Many,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
	labels: Vec<Label>,
	raw: String,
}

impl HostPattern {
	pub fn parse(pattern: &str) -> Option<HostPattern> {
		let trimmed = pattern.trim().trim_end_matches('.');
		if trimmed.is_empty() {
			return None;
		}
		let labels = trimmed
			.split('.')
			.map(|l| match l {
				"" => None,
				"*" => Some(Label::One),
				"**" => Some(Label::Many),
				lit => Some(Label::Literal(lit.to_ascii_lowercase())),
			})
			.collect::<Option<Vec<_>>>()?;
		Some(HostPattern {
			labels,
			raw: trimmed.to_string(),
		})
	}

	pub fn matches(&self, host: &str) -> bool {
		let host = host.trim_end_matches('.').to_ascii_lowercase();
		if host.is_empty() {
			return false;
		}
		let labels: Vec<&str> = host.split('.').collect();
		matches_at(&self.labels, &labels)
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}
}

impl fmt::Display for HostPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.raw)
	}
}

fn matches_at(pattern: &[Label], host: &[&str]) -> bool {
	match pattern.split_first() {
		None => host.is_empty(),
		Some((Label::Literal(lit), rest)) => match host.split_first() {
			Some((h, hrest)) => lit == h && matches_at(rest, hrest),
			None => false,
		},
		Some((Label::One, rest)) => match host.split_first() {
			Some((_, hrest)) => matches_at(rest, hrest),
			None => false,
		},
		Some((Label::Many, rest)) => {
			// One or more labels.
			(1..=host.len()).any(|n| matches_at(rest, &host[n..]))
		},
	}
}

/// A compiled list of patterns matched in order.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
	patterns: Vec<HostPattern>,
}

impl PatternList {
	pub fn parse(raw: &[String]) -> Result<PatternList, String> {
		let patterns = raw
			.iter()
			.map(|p| HostPattern::parse(p).ok_or_else(|| format!("invalid host pattern {p:?}")))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(PatternList { patterns })
	}

	pub fn matches(&self, host: &str) -> bool {
		self.patterns.iter().any(|p| p.matches(host))
	}

	pub fn is_empty(&self) -> bool {
		self.patterns.is_empty()
	}
}
