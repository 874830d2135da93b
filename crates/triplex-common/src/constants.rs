//! Authoritative protocol constants.
//!
//! Every timing and layout constant of the broker/worker protocol lives
//! here; components take their defaults from this module and tests may
//! override the timing values through the component config structs.

use std::time::Duration;

/// Interval between broker-initiated heartbeat rounds.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Worst-case ping delay margin granted on top of [`HEARTBEAT_INTERVAL`]
/// before a worker counts a ping loss.
pub const WCDPING: Duration = Duration::from_millis(500);

/// Consecutive missed pings after which a peer is declared dead.
pub const LIVENESS: u32 = 3;

/// Bounded wait for the registration exchange.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_millis(2500);

/// Every application message is exactly this many frames.
pub const NUM_FRAMES: usize = 3;
/// Frame index of the router-assigned source address.
pub const ID_FRAME: usize = 0;
/// Frame index of the empty delimiter.
pub const EMPTY_FRAME: usize = 1;
/// Frame index of the payload record.
pub const DATA_FRAME: usize = 2;
/// Frames that make up one envelope.
pub const ENVELOPE: usize = 3;

/// Byte length of an identity frame.
pub const LENGTH_ID_FRAME: usize = 5;

/// Upper bound on a registration signature, in bytes.
pub const MAX_LENGTH_SIGNATURE: usize = 32;

/// Replication degree the deployment is sized for.
pub const MAX_NMR: u8 = 3;

/// Size of the parameter buffer carried by a dispatched request.
pub const PARAM_SIZE: usize = 32;

/// First port handed out to cohort dispatch channels.
pub const DEALER_START_PORT: u16 = 5560;

/// Port on which the broker answers the external health checker.
pub const BROKER_PONG_PORT: u16 = 6000;

/// Base port for worker health-pong endpoints; a worker listens at
/// `SERVER_PONG_PORT + id + service * MAX_NMR`.
pub const SERVER_PONG_PORT: u16 = 6100;

/// Hard cap on one framed message, enforced at decode.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Simulated workload delay before a replica invokes its service body.
pub const WORKLOAD_DELAY: Duration = Duration::from_millis(500);
