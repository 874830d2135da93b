//! Triplex Common
//!
//! Shared building blocks for the triplex N-modular-redundancy broker:
//!
//! - **[`protocol`]**: the fixed-layout wire records exchanged between
//!   clients, the broker and service replicas, together with the 3-frame
//!   envelope conventions.
//! - **[`transport`]**: framed TCP channels implementing the router /
//!   dealer / reply / request patterns the broker topology is built on.
//! - **[`clock`]**: monotonic deadline arithmetic for heartbeat timers.
//! - **[`constants`]**: the authoritative protocol constants.

pub mod clock;
pub mod constants;
pub mod protocol;
pub mod transport;

pub use protocol::error::{Result, TriplexError};
