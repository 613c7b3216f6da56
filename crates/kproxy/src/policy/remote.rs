use std::time::Duration;

use tracing::debug;

use super::{Decision, PolicyEngine, PolicyError, RequestFacts};

/// Decision-service client: POSTs the fact bundle as JSON and expects a
/// `Decision` back. Transient failures are retried with a short backoff;
/// the caller applies the configured default action once we give up.
pub struct RemoteEngine {
	client: reqwest::Client,
	url: String,
	retries: u32,
}

impl RemoteEngine {
	pub fn new(url: String, timeout: Duration, retries: u32) -> Result<RemoteEngine, PolicyError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(PolicyError::Remote)?;
		Ok(RemoteEngine {
			client,
			url,
			retries,
		})
	}

	async fn call(&self, facts: &RequestFacts) -> Result<Decision, PolicyError> {
		let resp = self.client.post(&self.url).json(facts).send().await?;
		if !resp.status().is_success() {
			return Err(PolicyError::RemoteStatus(resp.status()));
		}
		Ok(resp.json::<Decision>().await?)
	}
}

#[async_trait::async_trait]
impl PolicyEngine for RemoteEngine {
	async fn evaluate(&self, facts: &RequestFacts) -> Result<Decision, PolicyError> {
		let mut last = None;
		for attempt in 0..=self.retries {
			if attempt > 0 {
				tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
			}
			match self.call(facts).await {
				Ok(d) => return Ok(d),
				Err(e) => {
					debug!(attempt, error = %e, "decision service call failed");
					last = Some(e);
				},
			}
		}
		Err(last.expect("at least one attempt"))
	}
}
