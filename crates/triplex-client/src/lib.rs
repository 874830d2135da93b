//! Triplex Client
//!
//! Submits typed requests to a broker and awaits the voted response.

pub mod client;

pub use client::{BrokerClient, ServiceOutcome};
