//! Policy evaluation: a pure function from request facts to a decision.
//!
//! Engines are side-effect-free and safe to call from any number of
//! concurrent tasks. Two implementations are bundled: a locally compiled
//! declarative rule set and a remote decision-service client.

mod remote;
mod rules;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use remote::RemoteEngine;
pub use rules::{RawRuleInput, Rule, RuleSet, RuleSetHandle};

use crate::config::DefaultAction;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
	#[error("failed to load rules: {0}")]
	Load(String),
	#[error("decision service: {0}")]
	Remote(#[from] reqwest::Error),
	#[error("decision service returned {0}")]
	RemoteStatus(http::StatusCode),
}

/// Everything an engine may consider about one request. Immutable for the
/// lifetime of the decision.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFacts {
	pub client_ip: IpAddr,
	pub client_mac: Option<String>,
	pub host: String,
	pub path: String,
	pub method: String,
	pub user_agent: String,
	pub encrypted: bool,
	pub timestamp: DateTime<Utc>,
}

impl RequestFacts {
	/// Facts for a DNS query, where only the name and client identity exist.
	pub fn for_dns(client_ip: IpAddr, qname: &str, now: DateTime<Utc>) -> RequestFacts {
		RequestFacts {
			client_ip,
			client_mac: None,
			host: qname.to_string(),
			path: String::new(),
			method: String::new(),
			user_agent: String::new(),
			encrypted: false,
			timestamp: now,
		}
	}

	/// The identifier usage tracking and logs key devices by: the MAC when
	/// known, the client IP otherwise.
	pub fn device_id(&self) -> String {
		self
			.client_mac
			.clone()
			.unwrap_or_else(|| self.client_ip.to_string())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
	Allow,
	Block,
	/// Only meaningful for DNS classification; HTTP treats it as `Allow`.
	Bypass,
}

impl Action {
	pub fn as_str(&self) -> &'static str {
		match self {
			Action::Allow => "allow",
			Action::Block => "block",
			Action::Bypass => "bypass",
		}
	}
}

impl From<DefaultAction> for Action {
	fn from(d: DefaultAction) -> Action {
		match d {
			DefaultAction::Allow => Action::Allow,
			DefaultAction::Block => Action::Block,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
	pub action: Action,
	pub reason: String,
	/// Identifier of the matched rule; empty when no rule matched.
	#[serde(default)]
	pub rule: String,
	/// Opaque aggregation tag, e.g. "video" or "gaming".
	#[serde(default)]
	pub category: String,
}

impl Decision {
	pub fn allow(reason: impl Into<String>) -> Decision {
		Decision {
			action: Action::Allow,
			reason: reason.into(),
			rule: String::new(),
			category: String::new(),
		}
	}
}

#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
	async fn evaluate(&self, facts: &RequestFacts) -> Result<Decision, PolicyError>;
}

/// Evaluate, falling back to the configured default action when the engine
/// itself fails.
pub async fn evaluate_or_default(
	engine: &dyn PolicyEngine,
	facts: &RequestFacts,
	default_action: DefaultAction,
) -> Decision {
	match engine.evaluate(facts).await {
		Ok(d) => d,
		Err(e) => {
			tracing::warn!(host = %facts.host, error = %e, "policy evaluation failed, applying default action");
			Decision {
				action: default_action.into(),
				reason: "policy evaluation failed".to_string(),
				rule: String::new(),
				category: String::new(),
			}
		},
	}
}
