//! Single-shot registration exchange.

use std::time::Duration;

use tracing::debug;

use triplex_common::protocol::messages::decode_port;
use triplex_common::protocol::{RegistrationModule, ServiceType};
use triplex_common::transport::RequestChannel;
use triplex_common::{Result, TriplexError};

/// How one registration attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The broker granted this dispatch port.
    Granted(u16),
    /// The broker replied with something that is not a port: a protocol
    /// failure the worker must treat as fatal.
    Malformed,
    /// No reply within the bounded wait; the caller may retry.
    TimedOut,
}

/// Sends one [`RegistrationModule`] and waits for the port reply.
///
/// No retries at this layer; the worker session decides what to do with
/// each outcome.
pub struct Registrator {
    broker_addr: String,
    signature: String,
    service: ServiceType,
    timeout: Duration,
}

impl Registrator {
    pub fn new(
        broker_addr: String,
        signature: String,
        service: ServiceType,
        timeout: Duration,
    ) -> Self {
        Registrator {
            broker_addr,
            signature,
            service,
            timeout,
        }
    }

    /// One registration exchange.
    ///
    /// A broker that cannot be reached counts as a timeout: from the
    /// worker's point of view both mean "try again later".
    pub async fn register(&self) -> Result<RegistrationOutcome> {
        let registration = RegistrationModule::new(&self.signature, self.service)?;

        let exchange = async {
            let mut channel = RequestChannel::connect(&self.broker_addr).await?;
            channel
                .request(registration.encode().to_vec(), self.timeout)
                .await
        };
        let raw = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(TriplexError::Timeout(_))) | Err(_) => return Ok(RegistrationOutcome::TimedOut),
            Ok(Err(TriplexError::Connection(e))) => {
                debug!("broker unreachable for registration: {e}");
                return Ok(RegistrationOutcome::TimedOut);
            }
            Ok(Err(e)) => return Err(e),
        };

        match decode_port(&raw) {
            Ok(port) if port > 0 => Ok(RegistrationOutcome::Granted(port)),
            _ => Ok(RegistrationOutcome::Malformed),
        }
    }
}
