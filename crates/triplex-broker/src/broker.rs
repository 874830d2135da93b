//! The broker event loop.
//!
//! A single task multiplexes four classes of channels: the request
//! channel (clients in), the registration channel (workers in), the
//! health channel (external checker in) and one dispatch channel per
//! ready cohort. All database state is owned by this loop; the loop wakes
//! on I/O or on the heartbeat tick.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use triplex_common::clock;
use triplex_common::constants::{
    BROKER_PONG_PORT, DATA_FRAME, DEALER_START_PORT, EMPTY_FRAME, HEARTBEAT_INTERVAL, ID_FRAME,
    MAX_NMR,
};
use triplex_common::protocol::envelope::{self, ping_identity, Multipart};
use triplex_common::protocol::messages::encode_port;
use triplex_common::protocol::{
    RegistrationModule, RequestModule, ResponseModule, ServiceModule, ServiceType,
};
use triplex_common::transport::{DealerChannel, RepChannel, RouterChannel};
use triplex_common::{Result, TriplexError};

use crate::database::ServiceDatabase;
use crate::voter;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Replication degree of every cohort.
    pub nmr: u8,
    /// Address the listening channels bind to.
    pub bind_address: String,
    /// Client request port (router pattern).
    pub port_router: u16,
    /// Worker registration port (router pattern).
    pub port_reg: u16,
    /// External health-checker port.
    pub port_health: u16,
    /// First port handed to cohort dispatch channels.
    pub dispatch_port_base: u16,
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            nmr: MAX_NMR,
            bind_address: "0.0.0.0".into(),
            port_router: 5555,
            port_reg: 5556,
            port_health: BROKER_PONG_PORT,
            dispatch_port_base: DEALER_START_PORT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    router: RouterChannel,
    reg: RouterChannel,
    health: RepChannel,
    /// Dispatch channels, owned here; cohorts refer to them by index.
    dispatch: Vec<DealerChannel>,
    dispatch_of: HashMap<ServiceType, usize>,
    db: ServiceDatabase,
}

impl Broker {
    /// Bind the request, registration and health channels.
    ///
    /// Allocation failures here are fatal; the process should terminate.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let router =
            RouterChannel::bind(&format!("{}:{}", config.bind_address, config.port_router)).await?;
        let reg =
            RouterChannel::bind(&format!("{}:{}", config.bind_address, config.port_reg)).await?;
        let health =
            RepChannel::bind(&format!("{}:{}", config.bind_address, config.port_health)).await?;

        let db = ServiceDatabase::new(config.nmr, config.dispatch_port_base, config.heartbeat_interval);

        info!(
            "broker up: requests on {}, registrations on {}, health on {}",
            router.local_addr(),
            reg.local_addr(),
            health.local_addr()
        );

        Ok(Broker {
            config,
            router,
            reg,
            health,
            dispatch: Vec::new(),
            dispatch_of: HashMap::new(),
            db,
        })
    }

    /// Actual client request port (useful when bound to port 0).
    pub fn router_port(&self) -> u16 {
        self.router.local_addr().port()
    }

    /// Actual registration port.
    pub fn reg_port(&self) -> u16 {
        self.reg.local_addr().port()
    }

    /// Actual health port.
    pub fn health_port(&self) -> u16 {
        self.health.local_addr().port()
    }

    /// Drive the broker forever.
    ///
    /// Returns only on a fatal fault: a listening channel dying or a
    /// dispatch endpoint failing to bind.
    pub async fn run(mut self) -> Result<()> {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = self.router.recv() => match inbound {
                    Some(frames) => {
                        if let Err(e) = self.handle_request(frames).await {
                            warn!("dropping client request: {e}");
                        }
                    }
                    None => return Err(TriplexError::Connection("request channel closed".into())),
                },
                inbound = self.reg.recv() => match inbound {
                    Some(frames) => self.handle_registration(frames).await?,
                    None => return Err(TriplexError::Connection("registration channel closed".into())),
                },
                Some(token) = self.health.recv() => {
                    debug!("ping from health checker");
                    self.health.reply(token, Vec::new()).await?;
                },
                Some((index, frames)) = next_dispatch(&mut self.dispatch), if !self.dispatch.is_empty() => {
                    if let Err(e) = self.handle_response(index, frames).await {
                        warn!("dropping replica reply: {e}");
                    }
                },
                _ = tick.tick() => {}
            }

            self.run_heartbeats().await;
        }
    }

    /// Admission: decode, check cohort readiness, fan out N copies.
    async fn handle_request(&mut self, frames: Multipart) -> Result<()> {
        envelope::check(&frames)?;
        let client_id = envelope::client_id(&frames[ID_FRAME])?;
        let request = RequestModule::decode(&frames[DATA_FRAME])?;
        let routing = frames[..=EMPTY_FRAME].to_vec();

        if !self.db.is_ready(request.service) {
            debug!(
                "service {} not available, refusing client {client_id}",
                request.service
            );
            let response = ResponseModule::not_available();
            return self
                .router
                .send(envelope::join(routing, response.encode().to_vec()))
                .await;
        }

        let seq = self
            .db
            .next_request_seq(request.service)
            .ok_or_else(|| TriplexError::Malformed("ready cohort without record".into()))?;
        let index = *self
            .dispatch_of
            .get(&request.service)
            .ok_or_else(|| TriplexError::Malformed("ready cohort without channel".into()))?;

        let module = ServiceModule::request(seq, request.parameter);
        for _ in 0..self.db.nmr() {
            self.dispatch[index]
                .send(envelope::join(routing.clone(), module.encode().to_vec()))
                .await?;
        }
        debug!(
            "dispatched request {seq} (service {}, parameter {}) for client {client_id}",
            request.service, request.parameter
        );

        self.db.push_request(request.service, client_id);
        self.db.update_timeout(request.service);
        Ok(())
    }

    /// Registration: record the signature, open the dispatch channel when
    /// the cohort completes, reply with the dispatch port.
    async fn handle_registration(&mut self, frames: Multipart) -> Result<()> {
        if let Err(e) = envelope::check(&frames) {
            warn!("dropping malformed registration envelope: {e}");
            return Ok(());
        }
        let registration = match RegistrationModule::decode(&frames[DATA_FRAME]) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping malformed registration: {e}");
                return Ok(());
            }
        };
        let routing = frames[..=EMPTY_FRAME].to_vec();

        let status = self.db.push_registration(&registration);
        match self.db.replica_slot(registration.service, registration.signature()) {
            Some(slot) => debug!(
                "registration of {:?} for service {}, replica slot {slot}, port {}",
                String::from_utf8_lossy(registration.signature()),
                registration.service,
                status.dispatch_port
            ),
            None => warn!(
                "cohort for service {} is full, ignoring signature {:?}",
                registration.service,
                String::from_utf8_lossy(registration.signature())
            ),
        }

        if status.newly_ready {
            // A bind failure here is an allocation failure: fatal.
            let addr = format!("{}:{}", self.config.bind_address, status.dispatch_port);
            let channel = DealerChannel::bind(&addr).await?;
            let index = self.dispatch.len();
            self.dispatch.push(channel);
            self.dispatch_of.insert(registration.service, index);
            info!(
                "service {} ready, dispatch channel on port {}",
                registration.service, status.dispatch_port
            );
        }

        self.reg
            .send(envelope::join(
                routing,
                encode_port(status.dispatch_port).to_vec(),
            ))
            .await
    }

    /// A dispatch channel turned readable: a pong, a duplicate notice, or
    /// a service result that may complete a vote.
    async fn handle_response(&mut self, _index: usize, frames: Multipart) -> Result<()> {
        envelope::check(&frames)?;
        let client_id = envelope::client_id(&frames[ID_FRAME])?;
        let reply = triplex_common::protocol::ServerReply::decode(&frames[DATA_FRAME])?;

        if reply.heartbeat {
            debug!("pong from replica {} of service {}", reply.id, reply.service);
            self.db.register_pong(reply.service, reply.id);
            return Ok(());
        }

        if reply.duplicated {
            // The replica saw a duplicate delivery and did not run the
            // service body; there is no result to count.
            debug!(
                "duplicate notice from replica {} of service {}",
                reply.id, reply.service
            );
            return Ok(());
        }

        let Some(count) = self.db.push_result(reply.service, client_id, reply.result) else {
            debug!(
                "result for no pending request (service {}, client {client_id})",
                reply.service
            );
            return Ok(());
        };
        if count < self.db.nmr() as usize {
            return Ok(());
        }

        let Some(values) = self.db.take_results(reply.service, client_id) else {
            return Ok(());
        };
        match voter::vote(&values, self.db.nmr()) {
            Some(result) => {
                debug!("vote decided {result} for client {client_id}");
                let response = ResponseModule::available(result);
                self.router
                    .send(envelope::join(
                        frames[..=EMPTY_FRAME].to_vec(),
                        response.encode().to_vec(),
                    ))
                    .await
            }
            None => {
                warn!(
                    "no majority among {values:?} for service {}, discarding request of client {client_id}",
                    reply.service
                );
                Ok(())
            }
        }
    }

    /// Close the pong round and ping the live replicas of every cohort
    /// whose deadline passed.
    async fn run_heartbeats(&mut self) {
        let at = clock::now();
        for service in self.db.due_services(at) {
            for id in self.db.check_pongs(service) {
                warn!("replica {id} of service {service} missed its pong, marked unreliable");
            }
            if self.db.is_degraded(service) {
                warn!("service {service} dropped below its majority threshold");
            }
            // The deadline is postponed on every admission, so a due
            // cohort has seen no new request for a whole interval; any
            // accumulator still open by now is a stuck or abandoned one.
            let backlog = self.db.pending_count(service);
            if backlog > 0 {
                warn!("service {service} has {backlog} requests still awaiting replies");
            }

            let Some(seq) = self.db.next_ping_seq(service) else {
                continue;
            };
            let Some(&index) = self.dispatch_of.get(&service) else {
                continue;
            };
            let live = self.db.reliable_count(service);
            debug!("heartbeat {seq} to {live} replicas of service {service}");

            let module = ServiceModule::heartbeat(seq);
            for _ in 0..live {
                let frames = envelope::join(
                    vec![ping_identity(), Vec::new()],
                    module.encode().to_vec(),
                );
                if let Err(e) = self.dispatch[index].send(frames).await {
                    warn!("heartbeat send failed for service {service}: {e}");
                }
            }
            self.db.update_timeout(service);
        }
    }
}

/// Wait for the next message on any dispatch channel.
async fn next_dispatch(dispatch: &mut [DealerChannel]) -> Option<(usize, Multipart)> {
    let receivers = dispatch
        .iter_mut()
        .enumerate()
        .map(|(index, channel)| Box::pin(async move { (index, channel.recv().await) }));
    let ((index, frames), _, _) = futures::future::select_all(receivers).await;
    frames.map(|f| (index, f))
}
