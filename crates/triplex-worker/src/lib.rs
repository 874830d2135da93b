//! Triplex Worker
//!
//! One worker is one replica of one service. It registers with the
//! broker to join its voting cohort, serves dispatched requests on the
//! granted dispatch channel, answers broker heartbeats, and exposes a
//! health-pong endpoint to the external checker. When the broker goes
//! silent for too long the worker tears the session down and registers
//! again.

pub mod registrator;
pub mod service;
pub mod session;

pub use registrator::{RegistrationOutcome, Registrator};
pub use service::{service_body, ServiceBody};
pub use session::{Worker, WorkerConfig};
