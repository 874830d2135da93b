//! Triplex wire protocol.
//!
//! Five fixed-layout records travel between the participants:
//!
//! - **[`RequestModule`]**: client → broker, a typed service invocation.
//! - **[`RegistrationModule`]**: replica → broker, joins a voting cohort.
//! - **[`ServiceModule`]**: broker → replica, a dispatched request or a
//!   heartbeat, distinguished by a flag.
//! - **[`ServerReply`]**: replica → broker, a result, a pong, or a
//!   duplicate-delivery notice.
//! - **[`ResponseModule`]**: broker → client, the voted result or a
//!   service-unavailable status.
//!
//! Records are packed byte layouts, not a serde format: the bit layout is
//! part of the wire contract. Sequence numbers, and the `service` and
//! `result` fields of [`ServerReply`], cross the wire in network byte
//! order; all other numeric fields are host order. The asymmetry is
//! preserved for wire compatibility.
//!
//! Multi-frame messages are exactly three frames,
//! `[identity | empty | data]`; see [`envelope`].

pub mod envelope;
pub mod error;
pub mod messages;

pub use error::{Result, TriplexError};
pub use messages::{
    RegistrationModule, RequestModule, ResponseModule, ServerReply, ServiceModule, ServiceStatus,
};

/// Tag identifying one service computation.
pub type ServiceType = u32;

/// Identity of one replica within a cohort, in `[0, N)`.
pub type ReplicaId = u8;
