use std::path::Path;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Deserialize;
use std::sync::Arc;

use super::{Action, Decision, PolicyEngine, PolicyError, RequestFacts};
use crate::config::DefaultAction;
use crate::dns::pattern::PatternList;

/// One declarative rule. Rules are evaluated in file order; the first rule
/// whose host patterns and client scope both match wins.
#[derive(Debug, Clone)]
pub struct Rule {
	pub id: String,
	pub hosts: PatternList,
	pub clients: Vec<IpNet>,
	pub action: Action,
	pub reason: String,
	pub category: String,
}

impl Rule {
	fn matches(&self, facts: &RequestFacts) -> bool {
		if !self.hosts.matches(&facts.host) {
			return false;
		}
		self.clients.is_empty() || self.clients.iter().any(|n| n.contains(&facts.client_ip))
	}
}

#[derive(Debug, Deserialize)]
struct RawRule {
	id: String,
	hosts: Vec<String>,
	#[serde(default)]
	clients: Vec<IpNet>,
	action: Action,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	category: String,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
	#[serde(default)]
	rules: Vec<RawRule>,
}

/// An immutable, compiled snapshot of the rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
	rules: Vec<Rule>,
	default_action: Action,
}

impl RuleSet {
	pub fn compile(raw: Vec<RawRuleInput>, default_action: DefaultAction) -> Result<RuleSet, PolicyError> {
		let rules = raw
			.into_iter()
			.map(|r| {
				let hosts = PatternList::parse(&r.hosts).map_err(PolicyError::Load)?;
				Ok(Rule {
					reason: r
						.reason
						.unwrap_or_else(|| format!("matched rule {}", r.id)),
					id: r.id,
					hosts,
					clients: r.clients,
					action: r.action,
					category: r.category,
				})
			})
			.collect::<Result<Vec<_>, PolicyError>>()?;
		Ok(RuleSet {
			rules,
			default_action: default_action.into(),
		})
	}

	pub fn empty(default_action: DefaultAction) -> RuleSet {
		RuleSet {
			rules: Vec::new(),
			default_action: default_action.into(),
		}
	}

	fn decide(&self, facts: &RequestFacts) -> Decision {
		for rule in &self.rules {
			if rule.matches(facts) {
				return Decision {
					action: rule.action,
					reason: rule.reason.clone(),
					rule: rule.id.clone(),
					category: rule.category.clone(),
				};
			}
		}
		Decision {
			action: self.default_action,
			reason: "no rule matched".to_string(),
			rule: String::new(),
			category: String::new(),
		}
	}
}

/// Raw rule fields decoupled from serde so callers can build rule sets
/// programmatically (tests, the admin surface).
#[derive(Debug, Clone)]
pub struct RawRuleInput {
	pub id: String,
	pub hosts: Vec<String>,
	pub clients: Vec<IpNet>,
	pub action: Action,
	pub reason: Option<String>,
	pub category: String,
}

impl From<RawRule> for RawRuleInput {
	fn from(r: RawRule) -> RawRuleInput {
		RawRuleInput {
			id: r.id,
			hosts: r.hosts,
			clients: r.clients,
			action: r.action,
			reason: r.reason,
			category: r.category,
		}
	}
}

/// The live rule set. Reloads publish a new snapshot; in-flight evaluations
/// keep the snapshot they started with.
pub struct RuleSetHandle {
	inner: ArcSwap<RuleSet>,
}

impl RuleSetHandle {
	pub fn new(rules: RuleSet) -> RuleSetHandle {
		RuleSetHandle {
			inner: ArcSwap::from_pointee(rules),
		}
	}

	pub fn load_file(
		path: &Path,
		default_action: DefaultAction,
	) -> Result<RuleSetHandle, PolicyError> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| PolicyError::Load(format!("{}: {e}", path.display())))?;
		let file: RuleFile =
			serde_yaml::from_str(&contents).map_err(|e| PolicyError::Load(e.to_string()))?;
		let compiled = RuleSet::compile(
			file.rules.into_iter().map(Into::into).collect(),
			default_action,
		)?;
		Ok(RuleSetHandle::new(compiled))
	}

	pub fn publish(&self, rules: RuleSet) {
		self.inner.store(Arc::new(rules));
	}
}

#[async_trait::async_trait]
impl PolicyEngine for RuleSetHandle {
	async fn evaluate(&self, facts: &RequestFacts) -> Result<Decision, PolicyError> {
		Ok(self.inner.load().decide(facts))
	}
}
