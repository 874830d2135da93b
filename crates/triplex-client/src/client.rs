use std::time::Duration;

use tracing::debug;

use triplex_common::protocol::{RequestModule, ResponseModule, ServiceStatus, ServiceType};
use triplex_common::transport::RequestChannel;
use triplex_common::{Result, TriplexError};

/// Default bound on one request-reply exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the broker said about a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// A majority of replicas agreed on this result.
    Available(i32),
    /// No ready cohort serves the requested service.
    NotAvailable,
}

/// Client for one broker's request channel.
///
/// Each submission opens a fresh lockstep exchange: the request is typed
/// by service tag, the reply carries either the voted result or a
/// service-unavailable status. An indecisive vote at the broker produces
/// no reply at all; that surfaces here as [`TriplexError::Timeout`].
pub struct BrokerClient {
    broker_addr: String,
    timeout: Duration,
}

impl BrokerClient {
    /// Client for the broker at `broker_addr` (e.g. `127.0.0.1:5555`).
    pub fn new(broker_addr: impl Into<String>) -> Self {
        BrokerClient {
            broker_addr: broker_addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound the whole exchange by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke `service` on `parameter` and await the consolidated result.
    pub async fn submit(&self, service: ServiceType, parameter: i32) -> Result<ServiceOutcome> {
        let request = RequestModule { service, parameter };
        debug!("submitting service {service} parameter {parameter} to {}", self.broker_addr);

        let exchange = async {
            let mut channel = RequestChannel::connect(&self.broker_addr).await?;
            channel.request(request.encode().to_vec(), self.timeout).await
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TriplexError::Timeout(self.timeout.as_millis() as u64))??;

        let response = ResponseModule::decode(&raw)?;
        Ok(match response.service_status {
            ServiceStatus::Available => ServiceOutcome::Available(response.result),
            ServiceStatus::NotAvailable => ServiceOutcome::NotAvailable,
        })
    }
}
