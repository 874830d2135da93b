//! Worker session scenarios against a scripted broker.
//!
//! The tests bind the broker-side channels directly, so registration
//! grants, heartbeat sequences and duplicate deliveries can be scripted
//! exactly.

use std::time::Duration;

use triplex_common::constants::{DATA_FRAME, EMPTY_FRAME, ID_FRAME};
use triplex_common::protocol::envelope::{self, identity_frame, ping_identity};
use triplex_common::protocol::messages::encode_port;
use triplex_common::protocol::{RegistrationModule, ServerReply, ServiceModule};
use triplex_common::transport::{DealerChannel, RequestChannel, RouterChannel};
use triplex_common::TriplexError;
use triplex_worker::{Worker, WorkerConfig};

const WAIT: Duration = Duration::from_secs(2);

struct Rig {
    reg: RouterChannel,
    dealer: DealerChannel,
    worker_handle: tokio::task::JoinHandle<triplex_common::Result<()>>,
    health_port: u16,
}

/// Start a worker for service 1 (`double`) wired at a scripted broker.
async fn rig() -> Rig {
    let reg = RouterChannel::bind("127.0.0.1:0").await.unwrap();
    let dealer = DealerChannel::bind("127.0.0.1:0").await.unwrap();

    let mut config = WorkerConfig::new(0, 1, "127.0.0.1", reg.local_addr().port());
    config.health_port = Some(0);
    config.heartbeat_interval = Duration::from_millis(50);
    config.wcdping = Duration::from_millis(25);
    config.liveness = 3;
    config.registration_timeout = Duration::from_millis(200);
    config.workload_delay = Duration::from_millis(10);

    let worker = Worker::bind(config).await.unwrap();
    let health_port = worker.health_port();
    let worker_handle = tokio::spawn(worker.run());

    Rig {
        reg,
        dealer,
        worker_handle,
        health_port,
    }
}

/// Answer the next registration with the rig's dispatch port.
async fn grant_registration(rig: &mut Rig) {
    let frames = tokio::time::timeout(WAIT, rig.reg.recv())
        .await
        .expect("no registration arrived")
        .unwrap();
    let registration = RegistrationModule::decode(&frames[DATA_FRAME]).unwrap();
    assert_eq!(registration.service, 1);
    let port = rig.dealer.local_addr().port();
    rig.reg
        .send(envelope::join(
            frames[..=EMPTY_FRAME].to_vec(),
            encode_port(port).to_vec(),
        ))
        .await
        .unwrap();
    // The worker's reply channel is wired once the dealer sees the peer.
    for _ in 0..100 {
        if rig.dealer.peer_count().await == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never connected to the dispatch endpoint");
}

async fn recv_reply(dealer: &mut DealerChannel) -> (Vec<u8>, ServerReply) {
    let frames = tokio::time::timeout(WAIT, dealer.recv())
        .await
        .expect("no reply from worker")
        .unwrap();
    let reply = ServerReply::decode(&frames[DATA_FRAME]).unwrap();
    (frames[ID_FRAME].clone(), reply)
}

async fn send_heartbeat(dealer: &DealerChannel, seq: u32) {
    let module = ServiceModule::heartbeat(seq);
    dealer
        .send(envelope::join(
            vec![ping_identity(), Vec::new()],
            module.encode().to_vec(),
        ))
        .await
        .unwrap();
}

async fn send_request(dealer: &DealerChannel, client: u32, seq: u32, parameter: i32) {
    let module = ServiceModule::request(seq, parameter);
    dealer
        .send(envelope::envelope(
            identity_frame(client),
            module.encode().to_vec(),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn heartbeats_are_ponged_with_the_ping_identity() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    // First ping adopts the broker's sequence baseline.
    send_heartbeat(&rig.dealer, 7).await;
    let (identity, pong) = recv_reply(&mut rig.dealer).await;
    assert!(pong.heartbeat);
    assert_eq!(pong.id, 0);
    assert_eq!(pong.service, 1);
    assert_eq!(identity, ping_identity());

    // In-sequence and replayed pings are both ponged.
    send_heartbeat(&rig.dealer, 8).await;
    let (_, pong) = recv_reply(&mut rig.dealer).await;
    assert!(pong.heartbeat);
    send_heartbeat(&rig.dealer, 8).await;
    let (_, pong) = recv_reply(&mut rig.dealer).await;
    assert!(pong.heartbeat);
}

#[tokio::test]
async fn accepted_request_returns_computed_result() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    send_request(&rig.dealer, 77, 5, 21).await;
    let (identity, reply) = recv_reply(&mut rig.dealer).await;
    assert_eq!(identity, identity_frame(77));
    assert!(!reply.heartbeat);
    assert!(!reply.duplicated);
    assert_eq!(reply.service, 1);
    assert_eq!(reply.result, 42);
}

#[tokio::test]
async fn duplicate_request_is_acknowledged_without_recompute() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    send_request(&rig.dealer, 77, 5, 21).await;
    let (_, first) = recv_reply(&mut rig.dealer).await;
    assert_eq!(first.result, 42);

    // Same sequence again: one duplicate notice, no second result.
    send_request(&rig.dealer, 77, 5, 21).await;
    let (_, notice) = recv_reply(&mut rig.dealer).await;
    assert!(notice.duplicated);
    assert!(!notice.heartbeat);

    let extra = tokio::time::timeout(Duration::from_millis(150), rig.dealer.recv()).await;
    assert!(extra.is_err(), "unexpected extra reply {extra:?}");
}

#[tokio::test]
async fn in_sequence_requests_advance() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    send_request(&rig.dealer, 10, 5, 1).await;
    let (_, first) = recv_reply(&mut rig.dealer).await;
    assert_eq!(first.result, 2);

    send_request(&rig.dealer, 11, 6, 2).await;
    let (_, second) = recv_reply(&mut rig.dealer).await;
    assert_eq!(second.result, 4);
}

#[tokio::test]
async fn health_endpoint_pongs() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    let mut checker = RequestChannel::connect(&format!("127.0.0.1:{}", rig.health_port))
        .await
        .unwrap();
    let pong = checker.request(Vec::new(), WAIT).await.unwrap();
    assert!(pong.is_empty());
}

#[tokio::test]
async fn health_endpoint_pongs_while_unregistered() {
    let rig = rig().await;
    // No registration granted: the worker is stuck retrying, but the
    // health endpoint must still answer.
    let mut checker = RequestChannel::connect(&format!("127.0.0.1:{}", rig.health_port))
        .await
        .unwrap();
    let pong = checker.request(Vec::new(), WAIT).await.unwrap();
    assert!(pong.is_empty());
}

#[tokio::test]
async fn unanswered_registration_is_retried() {
    let mut rig = rig().await;

    // Swallow the first attempt; the worker must come back on its own.
    let first = tokio::time::timeout(WAIT, rig.reg.recv()).await.unwrap();
    assert!(first.is_some());
    grant_registration(&mut rig).await;

    send_request(&rig.dealer, 5, 1, 3).await;
    let (_, reply) = recv_reply(&mut rig.dealer).await;
    assert_eq!(reply.result, 6);
}

#[tokio::test]
async fn malformed_registration_grant_is_fatal() {
    let mut rig = rig().await;

    let frames = tokio::time::timeout(WAIT, rig.reg.recv()).await.unwrap().unwrap();
    rig.reg
        .send(envelope::join(
            frames[..=EMPTY_FRAME].to_vec(),
            b"bogus".to_vec(),
        ))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(WAIT, rig.worker_handle).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(TriplexError::RegistrationRejected)));
}

#[tokio::test]
async fn silent_broker_triggers_reregistration_and_resync() {
    let mut rig = rig().await;
    grant_registration(&mut rig).await;

    send_request(&rig.dealer, 20, 4, 10).await;
    let (_, reply) = recv_reply(&mut rig.dealer).await;
    assert_eq!(reply.result, 20);

    // Go silent past liveness * (heartbeat_interval + wcdping): the
    // worker declares the broker dead and registers again.
    grant_registration(&mut rig).await;

    // The new session adopted a fresh baseline: a sequence unrelated to
    // the old one is accepted, not flagged as duplicate.
    send_request(&rig.dealer, 21, 900, 7).await;
    let (_, reply) = recv_reply(&mut rig.dealer).await;
    assert!(!reply.duplicated);
    assert_eq!(reply.result, 14);
}
