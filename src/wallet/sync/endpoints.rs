//! Circular failover between redundant indexer endpoints.

use crate::wallet::WalletSyncError;

use tracing::warn;

/// Ordered endpoints with a current position.
///
/// Every reported error moves to the next endpoint, wrapping to the first. There is no weighting
/// and no exclusion; a failed endpoint is tried again once the rotation comes back to it.
#[derive(Debug, Clone)]
pub struct EndpointFailoverManager<T> {
    endpoints: Vec<T>,
    index: usize,
    consecutive_failures: usize,
}

impl<T> EndpointFailoverManager<T> {
    pub fn new(endpoints: Vec<T>) -> Result<Self, WalletSyncError> {
        if endpoints.is_empty() {
            return Err(WalletSyncError::Config(
                "At least one indexer endpoint is required".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            index: 0,
            consecutive_failures: 0,
        })
    }

    pub fn current(&self) -> &T {
        &self.endpoints[self.index]
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Record a failure of the current endpoint and advance to the next one.
    pub fn report_error(&mut self) -> &T {
        self.consecutive_failures += 1;
        self.index = (self.index + 1) % self.endpoints.len();
        warn!(
            "Switching to indexer endpoint #{} ({} consecutive failures)",
            self.index, self.consecutive_failures
        );
        &self.endpoints[self.index]
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// True once every endpoint failed since the last success.
    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures >= self.endpoints.len()
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }
}
