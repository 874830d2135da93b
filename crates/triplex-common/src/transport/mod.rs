//! Framed TCP message channels.
//!
//! The broker topology is built on five channel patterns, named by their
//! semantics:
//!
//! - **[`RouterChannel`]** (bind): tags every inbound message with the
//!   source peer's identity frame and routes outbound messages by it.
//!   Fronts the client request port and the registration port.
//! - **[`DealerChannel`]** (bind): distributes sends round-robin across
//!   connected peers and fair-queues receives. One per ready cohort.
//! - **[`ReplyChannel`]** (connect): a worker's end of a dispatch channel;
//!   yields `(routing, payload)` pairs and carries the routing frames back
//!   on the reply so it reaches the originator.
//! - **[`RequestChannel`]** (connect): lockstep send/receive with a
//!   bounded wait. Used by clients and the registrator.
//! - **[`RepChannel`]** (bind): bare request-reply, used for the health
//!   interfaces.
//!
//! # Wire Format
//!
//! One message is `[4-byte total length as u32 big-endian]` followed by,
//! per frame, `[4-byte frame length as u32 big-endian] + [frame bytes]`.
//! Messages above [`MAX_MESSAGE_SIZE`](crate::constants::MAX_MESSAGE_SIZE)
//! are rejected at decode to bound allocation.
//!
//! Broker-side sends never block: a peer whose queue is full has the
//! message dropped with a warning.

pub mod dealer;
pub mod framing;
pub mod rep;
pub mod reply;
pub mod request;
pub mod router;

pub use dealer::DealerChannel;
pub use rep::{RepChannel, ReplyToken};
pub use reply::ReplyChannel;
pub use request::RequestChannel;
pub use router::RouterChannel;

/// Depth of the per-peer and inbound mailboxes.
pub(crate) const CHANNEL_DEPTH: usize = 64;
