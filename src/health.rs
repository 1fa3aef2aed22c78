use std::time::Duration;

use reqwest::{Client, Url};

/// Best-effort liveness check against a node's base address.
#[derive(Clone, Debug)]
pub struct HealthChecker {
    client: Client,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Returns `true` when the node answered with any HTTP response.
    ///
    /// Transport errors and timeouts are `false`. The status code is not
    /// inspected: inference servers commonly answer `/` with 404. No retries.
    pub async fn check(&self, address: &Url) -> bool {
        let request = self.client.get(address.clone()).timeout(self.timeout);
        match request.send().await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(address = %address, error = %err, "health check failed");
                false
            }
        }
    }
}
