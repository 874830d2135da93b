//! The worker session state machine.
//!
//! The session is a single cooperative loop with detached task contexts
//! for service computations. The loop owns the reply channel; detached
//! tasks push their results through a mailbox instead of writing the
//! channel themselves, which keeps sends serialized at message
//! granularity.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use triplex_common::constants::{
    HEARTBEAT_INTERVAL, LIVENESS, MAX_NMR, REGISTRATION_TIMEOUT, SERVER_PONG_PORT, WCDPING,
    WORKLOAD_DELAY,
};
use triplex_common::protocol::envelope::Multipart;
use triplex_common::protocol::{ReplicaId, ServerReply, ServiceModule, ServiceType};
use triplex_common::transport::{RepChannel, ReplyChannel};
use triplex_common::{Result, TriplexError};

use crate::registrator::{RegistrationOutcome, Registrator};
use crate::service::{service_body, ServiceBody};

/// Depth of the detached-task result mailbox.
const MAILBOX_DEPTH: usize = 64;
/// Pause between attempts to reach a dispatch endpoint that is not up yet.
const RETRY_PAUSE: Duration = Duration::from_millis(250);
/// Attempts before giving up on a granted dispatch port and re-registering.
const DISPATCH_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity among the replicas of one service.
    pub id: ReplicaId,
    /// Service this replica computes.
    pub service: ServiceType,
    /// Broker host the worker registers with and connects back to.
    pub broker_address: String,
    /// Broker registration port.
    pub broker_port: u16,
    /// Health-pong port override; derived from id and service when unset.
    pub health_port: Option<u16>,
    pub heartbeat_interval: Duration,
    pub wcdping: Duration,
    pub liveness: u32,
    pub registration_timeout: Duration,
    pub workload_delay: Duration,
}

impl WorkerConfig {
    pub fn new(
        id: ReplicaId,
        service: ServiceType,
        broker_address: impl Into<String>,
        broker_port: u16,
    ) -> Self {
        WorkerConfig {
            id,
            service,
            broker_address: broker_address.into(),
            broker_port,
            health_port: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            wcdping: WCDPING,
            liveness: LIVENESS,
            registration_timeout: REGISTRATION_TIMEOUT,
            workload_delay: WORKLOAD_DELAY,
        }
    }

    /// Deterministic health-pong port so the external checker can address
    /// each replica without discovery.
    fn derived_health_port(&self) -> u16 {
        SERVER_PONG_PORT + self.id as u16 + (self.service * MAX_NMR as u32) as u16
    }
}

/// What happened to an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeqCheck {
    /// In sequence (or first contact); the expectation advanced.
    Accepted,
    /// Out of sequence: a duplicate delivery.
    Duplicate,
}

/// Advance `expected` against a received sequence number.
///
/// An expectation of 0 means nothing was seen on this session yet; the
/// received value is adopted as the baseline. This lets the worker join a
/// broker whose sequence is already past 0, and resynchronize after a
/// re-registration.
fn check_seq(expected: &mut u32, received: u32) -> SeqCheck {
    if *expected == 0 {
        *expected = received;
    }
    if received == *expected {
        *expected += 1;
        SeqCheck::Accepted
    } else {
        SeqCheck::Duplicate
    }
}

/// One replica of one service.
pub struct Worker {
    config: WorkerConfig,
    body: ServiceBody,
    signature: String,
    health: RepChannel,
    health_port: u16,
    /// Next heartbeat sequence expected from the broker; 0 = none seen.
    ping_id: u32,
    /// Next request sequence expected from the broker; 0 = none seen.
    request_id: u32,
}

impl Worker {
    /// Resolve the service body and bind the health-pong endpoint.
    ///
    /// An unknown service tag or an unbindable health port is fatal.
    pub async fn bind(config: WorkerConfig) -> Result<Self> {
        let body =
            service_body(config.service).ok_or(TriplexError::UnknownService(config.service))?;
        let port = config.health_port.unwrap_or_else(|| config.derived_health_port());
        let health = RepChannel::bind(&format!("0.0.0.0:{port}")).await?;
        let health_port = health.local_addr().port();
        let signature = format!("worker-{}-{}", config.service, config.id);

        info!(
            "worker {} for service {} up, health pongs on port {health_port}",
            config.id, config.service
        );

        Ok(Worker {
            config,
            body,
            signature,
            health,
            health_port,
            ping_id: 0,
            request_id: 0,
        })
    }

    /// Actual health-pong port.
    pub fn health_port(&self) -> u16 {
        self.health_port
    }

    /// Run the registration/serve cycle forever.
    ///
    /// Returns only on a fatal fault: a registration the broker answered
    /// with something other than a port.
    pub async fn run(mut self) -> Result<()> {
        let registrator = Registrator::new(
            format!("{}:{}", self.config.broker_address, self.config.broker_port),
            self.signature.clone(),
            self.config.service,
            self.config.registration_timeout,
        );

        loop {
            let dispatch_port = self.register(&registrator).await?;
            info!("registration ok, granted dispatch port {dispatch_port}");

            let Some(reply) = self.connect_dispatch(dispatch_port).await else {
                continue;
            };

            // A fresh session means a fresh broker sequence space: re-arm
            // the adopt-on-first baselines.
            self.ping_id = 0;
            self.request_id = 0;

            self.serve(reply).await;
            warn!("broker session over, re-entering registration");
        }
    }

    /// Retry registration until granted, answering health pings in
    /// between. A malformed grant is fatal.
    async fn register(&mut self, registrator: &Registrator) -> Result<u16> {
        loop {
            let outcome = {
                let attempt = registrator.register();
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        outcome = &mut attempt => break outcome?,
                        Some(token) = self.health.recv() => {
                            debug!("ping from health checker");
                            self.health.reply(token, Vec::new()).await?;
                        }
                    }
                }
            };
            match outcome {
                RegistrationOutcome::Granted(port) => return Ok(port),
                RegistrationOutcome::Malformed => {
                    return Err(TriplexError::RegistrationRejected)
                }
                RegistrationOutcome::TimedOut => {
                    warn!("registration timed out, retrying");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    /// Connect to the granted dispatch endpoint.
    ///
    /// The endpoint only appears once the whole cohort has registered, so
    /// early attempts are expected to fail; after the retry budget the
    /// worker goes back to registration.
    async fn connect_dispatch(&self, port: u16) -> Option<ReplyChannel> {
        let addr = format!("{}:{}", self.config.broker_address, port);
        for attempt in 0..DISPATCH_ATTEMPTS {
            match ReplyChannel::connect(&addr).await {
                Ok(channel) => return Some(channel),
                Err(e) => debug!("dispatch connect attempt {attempt} failed: {e}"),
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
        warn!("dispatch endpoint {addr} never came up, re-registering");
        None
    }

    /// The steady-state session loop. Returns when the broker is presumed
    /// dead or the channel closes.
    async fn serve(&mut self, mut reply: ReplyChannel) {
        let (task_tx, mut mailbox) = mpsc::channel::<(Multipart, ServerReply)>(MAILBOX_DEPTH);
        let liveness_wait = self.config.heartbeat_interval + self.config.wcdping;
        let mut ping_loss: u32 = 0;
        let mut deadline = tokio::time::Instant::now() + liveness_wait;

        loop {
            tokio::select! {
                inbound = reply.recv() => {
                    let Some((routing, data)) = inbound else {
                        warn!("dispatch channel closed by broker");
                        return;
                    };
                    ping_loss = 0;
                    deadline = tokio::time::Instant::now() + liveness_wait;
                    if let Err(e) = self.handle_dispatch(routing, data, &task_tx, &mut reply).await {
                        warn!("dropping dispatch message: {e}");
                    }
                }
                Some(token) = self.health.recv() => {
                    debug!("ping from health checker");
                    if let Err(e) = self.health.reply(token, Vec::new()).await {
                        warn!("health pong failed: {e}");
                    }
                }
                Some((routing, server_reply)) = mailbox.recv() => {
                    if let Err(e) = reply.send(routing, server_reply.encode().to_vec()).await {
                        warn!("result delivery failed: {e}");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    ping_loss += 1;
                    warn!("broker ping timeout ({ping_loss}/{})", self.config.liveness);
                    deadline = tokio::time::Instant::now() + liveness_wait;
                    if ping_loss >= self.config.liveness {
                        warn!("broker presumed dead");
                        return;
                    }
                }
            }
        }
    }

    /// Disambiguate a dispatched message and act on it.
    async fn handle_dispatch(
        &mut self,
        routing: Multipart,
        data: Vec<u8>,
        tasks: &mpsc::Sender<(Multipart, ServerReply)>,
        reply: &mut ReplyChannel,
    ) -> Result<()> {
        let module = ServiceModule::decode(&data)?;

        if module.heartbeat {
            let check = check_seq(&mut self.ping_id, module.seq_id);
            debug!(
                "received ping {} ({check:?}), expecting {} next",
                module.seq_id, self.ping_id
            );
            // A stale ping still deserves a pong; only the expectation
            // refuses to advance.
            let pong = ServerReply::pong(self.config.id, self.config.service);
            return reply.send(routing, pong.encode().to_vec()).await;
        }

        match check_seq(&mut self.request_id, module.seq_id) {
            SeqCheck::Accepted => {
                debug!("received request {}, spawning service task", module.seq_id);
                self.spawn_service_task(routing, module.parameter(), tasks.clone());
                Ok(())
            }
            SeqCheck::Duplicate => {
                debug!(
                    "duplicate delivery of request {} (expecting {})",
                    module.seq_id, self.request_id
                );
                let notice = ServerReply::duplicate(self.config.id, self.config.service);
                reply.send(routing, notice.encode().to_vec()).await
            }
        }
    }

    /// Offload one accepted request to a detached task.
    ///
    /// The task simulates its workload, invokes the service body and
    /// pushes the reply into the mailbox; the session loop performs the
    /// actual channel write.
    fn spawn_service_task(
        &self,
        routing: Multipart,
        parameter: i32,
        tasks: mpsc::Sender<(Multipart, ServerReply)>,
    ) {
        let body = self.body;
        let id = self.config.id;
        let service = self.config.service;
        let delay = self.config.workload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = body(parameter);
            // The session may have ended while computing; then the result
            // simply has nowhere to go.
            let _ = tasks.send((routing, ServerReply::result(id, service, result))).await;
        });
    }
}
