//! Triplex Broker
//!
//! The broker fronts a pool of replicated service workers with N-modular
//! redundancy: each admitted client request is fanned out to the N
//! replicas of its service cohort, the independent results are collected,
//! and a plurality vote decides the single response sent back to the
//! client.
//!
//! # Components
//!
//! - **[`ServiceDatabase`]**: cohort registry: signatures, readiness,
//!   reliability masks, heartbeat sequence numbers, pending result
//!   accumulators.
//! - **[`voter`]**: the plurality decision over N replica results.
//! - **[`Broker`]**: the single-task event loop multiplexing the request,
//!   registration, health and per-cohort dispatch channels.

pub mod broker;
pub mod database;
pub mod voter;

pub use broker::{Broker, BrokerConfig};
pub use database::{RegistrationStatus, ServiceDatabase};
