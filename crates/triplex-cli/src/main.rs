//! # Triplex CLI Entry Point
//!
//! Role driver for the triplex N-modular-redundancy broker. One binary
//! covers the three roles of a deployment:
//!
//! ```bash
//! # Start the broker (N = 3, default ports)
//! triplex broker
//!
//! # Start the three replicas of service 1
//! triplex worker -i 0 -s 1
//! triplex worker -i 1 -s 1
//! triplex worker -i 2 -s 1
//!
//! # Invoke service 1 on parameter 21 (outputs raw JSON)
//! triplex client -s 1 -p 21
//! ```
//!
//! Exit status is 0 on a clean run and nonzero on fatal faults
//! (allocation failures, a malformed registration grant).

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use serde::Serialize;

use triplex_broker::{Broker, BrokerConfig};
use triplex_client::{BrokerClient, ServiceOutcome};
use triplex_common::constants::{BROKER_PONG_PORT, DEALER_START_PORT, HEARTBEAT_INTERVAL};
use triplex_worker::{Worker, WorkerConfig};

/// triplex - fault-tolerant request-reply broker with majority voting
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// One subcommand per deployment role.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Broker(BrokerArgs),
    Worker(WorkerArgs),
    Client(ClientArgs),
}

/// start the dispatch-and-voting broker
#[derive(FromArgs)]
#[argh(subcommand, name = "broker")]
struct BrokerArgs {
    /// replication degree of every service cohort
    #[argh(option, short = 'n', default = "3")]
    nmr: u8,

    /// address the broker channels bind to
    #[argh(option, short = 'b', default = "\"0.0.0.0\".into()")]
    bind: String,

    /// client request port
    #[argh(option, long = "port-router", default = "5555")]
    port_router: u16,

    /// worker registration port
    #[argh(option, long = "port-reg", default = "5556")]
    port_reg: u16,

    /// external health-checker port
    #[argh(option, long = "port-health", default = "BROKER_PONG_PORT")]
    port_health: u16,

    /// first port handed to cohort dispatch channels
    #[argh(option, long = "dispatch-port-base", default = "DEALER_START_PORT")]
    dispatch_port_base: u16,
}

/// start one service replica
#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
struct WorkerArgs {
    /// replica identity within the cohort
    #[argh(option, short = 'i')]
    id: u8,

    /// service type to provide
    #[argh(option, short = 's')]
    service: u32,

    /// broker host to register with
    #[argh(option, long = "broker-address", default = "\"127.0.0.1\".into()")]
    broker_address: String,

    /// broker registration port
    #[argh(option, long = "broker-port", default = "5556")]
    broker_port: u16,
}

/// invoke a service once and print the outcome as JSON
#[derive(FromArgs)]
#[argh(subcommand, name = "client")]
struct ClientArgs {
    /// service type to invoke
    #[argh(option, short = 's')]
    service: u32,

    /// request parameter
    #[argh(option, short = 'p')]
    parameter: i32,

    /// broker host
    #[argh(option, long = "broker-address", default = "\"127.0.0.1\".into()")]
    broker_address: String,

    /// broker request port
    #[argh(option, long = "broker-port", default = "5555")]
    broker_port: u16,

    /// bound on the whole exchange, in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // The client role keeps stdout clean for scripting; broker and worker
    // log at info unless RUST_LOG says otherwise.
    if !matches!(cli.command, Commands::Client(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Broker(args) => {
            tracing::info!(
                "starting broker: nmr={}, router port {}, registration port {}",
                args.nmr,
                args.port_router,
                args.port_reg
            );
            let config = BrokerConfig {
                nmr: args.nmr,
                bind_address: args.bind,
                port_router: args.port_router,
                port_reg: args.port_reg,
                port_health: args.port_health,
                dispatch_port_base: args.dispatch_port_base,
                heartbeat_interval: HEARTBEAT_INTERVAL,
            };
            let broker = Broker::bind(config).await?;
            broker.run().await?;
            Ok(())
        }
        Commands::Worker(args) => {
            tracing::info!(
                "starting worker {} for service {} against {}:{}",
                args.id,
                args.service,
                args.broker_address,
                args.broker_port
            );
            let config =
                WorkerConfig::new(args.id, args.service, args.broker_address, args.broker_port);
            let worker = Worker::bind(config).await?;
            worker.run().await?;
            Ok(())
        }
        Commands::Client(args) => run_client(args).await,
    }
}

/// JSON shape of the client role's stdout.
#[derive(Serialize)]
struct ClientOutput {
    service_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<i32>,
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let client = BrokerClient::new(format!("{}:{}", args.broker_address, args.broker_port))
        .with_timeout(Duration::from_millis(args.timeout_ms));
    let outcome = client.submit(args.service, args.parameter).await?;

    let output = match outcome {
        ServiceOutcome::Available(result) => ClientOutput {
            service_status: "available",
            result: Some(result),
        },
        ServiceOutcome::NotAvailable => ClientOutput {
            service_status: "not_available",
            result: None,
        },
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}
