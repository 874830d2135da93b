//! Indexed registry of services, replicas, pending requests and
//! heartbeat state.
//!
//! The database is owned exclusively by the broker loop; every mutation
//! happens there, so no locking is involved.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use triplex_common::clock::Deadline;
use triplex_common::protocol::{RegistrationModule, ReplicaId, ServiceType};

use crate::voter::majority_threshold;

/// Replies collected so far for one pending client request.
#[derive(Debug, Default)]
struct ResultAccumulator {
    replies: Vec<i32>,
}

/// Per-service record: the N replicas of one service plus its dispatch
/// endpoint, reliability state and pending requests.
struct Cohort {
    dispatch_port: u16,
    ready: bool,
    /// Distinct registration signatures; the index is the replica slot.
    signatures: Vec<Vec<u8>>,
    /// Replicas currently believed live.
    reliable: Vec<bool>,
    /// Pongs observed since the last heartbeat round. Starts all-true so
    /// the round before the first ping does not mark anyone down.
    pong_seen: Vec<bool>,
    missed_pongs: Vec<u32>,
    ping_seq: u32,
    request_seq: u32,
    pending: HashMap<u32, ResultAccumulator>,
    deadline: Deadline,
}

impl Cohort {
    fn new(dispatch_port: u16, nmr: u8, heartbeat_interval: Duration) -> Self {
        let n = nmr as usize;
        Cohort {
            dispatch_port,
            ready: false,
            signatures: Vec::with_capacity(n),
            reliable: vec![true; n],
            pong_seen: vec![true; n],
            missed_pongs: vec![0; n],
            // 0 is the worker-side adopt-on-first sentinel, never emitted.
            ping_seq: 1,
            request_seq: 1,
            pending: HashMap::new(),
            deadline: Deadline::after(heartbeat_interval),
        }
    }
}

/// Outcome of recording one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStatus {
    /// Dispatch port to hand back to the registrant.
    pub dispatch_port: u16,
    /// True exactly once, when this registration completed the cohort.
    pub newly_ready: bool,
}

pub struct ServiceDatabase {
    nmr: u8,
    heartbeat_interval: Duration,
    next_dispatch_port: u16,
    cohorts: HashMap<ServiceType, Cohort>,
}

impl ServiceDatabase {
    pub fn new(nmr: u8, dispatch_port_base: u16, heartbeat_interval: Duration) -> Self {
        ServiceDatabase {
            nmr,
            heartbeat_interval,
            next_dispatch_port: dispatch_port_base,
            cohorts: HashMap::new(),
        }
    }

    pub fn nmr(&self) -> u8 {
        self.nmr
    }

    /// Record a registration, creating the cohort on first contact.
    ///
    /// Duplicate signatures are idempotent and an (N+1)th distinct
    /// signature is ignored; both still learn the dispatch port, keeping
    /// the exchange total.
    pub fn push_registration(&mut self, registration: &RegistrationModule) -> RegistrationStatus {
        let nmr = self.nmr as usize;
        let cohort = match self.cohorts.entry(registration.service) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let port = self.next_dispatch_port;
                self.next_dispatch_port += 1;
                entry.insert(Cohort::new(port, self.nmr, self.heartbeat_interval))
            }
        };

        let signature = registration.signature().to_vec();
        if !cohort.signatures.contains(&signature) && cohort.signatures.len() < nmr {
            cohort.signatures.push(signature);
        }

        let newly_ready = !cohort.ready && cohort.signatures.len() == nmr;
        if newly_ready {
            cohort.ready = true;
            cohort.deadline.rearm(self.heartbeat_interval);
        }

        RegistrationStatus {
            dispatch_port: cohort.dispatch_port,
            newly_ready,
        }
    }

    /// True iff N distinct signatures have registered for `service`.
    pub fn is_ready(&self, service: ServiceType) -> bool {
        self.cohorts.get(&service).is_some_and(|c| c.ready)
    }

    /// Replica slot assigned to `signature`, if it registered.
    pub fn replica_slot(&self, service: ServiceType, signature: &[u8]) -> Option<ReplicaId> {
        self.cohorts.get(&service)?.signatures.iter().position(|s| s == signature).map(|i| i as ReplicaId)
    }

    /// Open an accumulator for `(service, client_id)`.
    ///
    /// A second submission while one is pending coalesces by overwrite.
    pub fn push_request(&mut self, service: ServiceType, client_id: u32) {
        if let Some(cohort) = self.cohorts.get_mut(&service) {
            cohort.pending.insert(client_id, ResultAccumulator::default());
        }
    }

    /// Append one replica result; returns the reply count so far, or
    /// `None` when no request is pending for this client.
    pub fn push_result(&mut self, service: ServiceType, client_id: u32, result: i32) -> Option<usize> {
        let accumulator = self
            .cohorts
            .get_mut(&service)?
            .pending
            .get_mut(&client_id)?;
        accumulator.replies.push(result);
        Some(accumulator.replies.len())
    }

    /// Remove the accumulator and hand back the collected values.
    pub fn take_results(&mut self, service: ServiceType, client_id: u32) -> Option<Vec<i32>> {
        self.cohorts
            .get_mut(&service)?
            .pending
            .remove(&client_id)
            .map(|acc| acc.replies)
    }

    pub fn pending_count(&self, service: ServiceType) -> usize {
        self.cohorts.get(&service).map_or(0, |c| c.pending.len())
    }

    /// Record a pong; the replica is believed live again.
    pub fn register_pong(&mut self, service: ServiceType, id: ReplicaId) {
        let Some(cohort) = self.cohorts.get_mut(&service) else {
            return;
        };
        let slot = id as usize;
        if slot >= cohort.pong_seen.len() {
            return;
        }
        cohort.pong_seen[slot] = true;
        cohort.reliable[slot] = true;
        cohort.missed_pongs[slot] = 0;
    }

    /// Close the heartbeat round: replicas whose pong never arrived are
    /// marked unreliable. Returns the slots newly counted as lost.
    pub fn check_pongs(&mut self, service: ServiceType) -> Vec<ReplicaId> {
        let Some(cohort) = self.cohorts.get_mut(&service) else {
            return Vec::new();
        };
        let mut lost = Vec::new();
        for slot in 0..cohort.pong_seen.len() {
            if !cohort.pong_seen[slot] {
                cohort.missed_pongs[slot] += 1;
                if cohort.reliable[slot] {
                    cohort.reliable[slot] = false;
                    lost.push(slot as ReplicaId);
                }
            }
            cohort.pong_seen[slot] = false;
        }
        lost
    }

    /// Replicas currently believed live.
    pub fn reliable_count(&self, service: ServiceType) -> u8 {
        self.cohorts
            .get(&service)
            .map_or(0, |c| c.reliable.iter().filter(|&&r| r).count() as u8)
    }

    /// True once the live population dropped below the majority threshold.
    pub fn is_degraded(&self, service: ServiceType) -> bool {
        (self.reliable_count(service) as usize) < majority_threshold(self.nmr)
    }

    /// Heartbeat sequence number to emit next; strictly increasing.
    pub fn next_ping_seq(&mut self, service: ServiceType) -> Option<u32> {
        let cohort = self.cohorts.get_mut(&service)?;
        let seq = cohort.ping_seq;
        cohort.ping_seq += 1;
        Some(seq)
    }

    /// Request sequence number to stamp on the next dispatch.
    pub fn next_request_seq(&mut self, service: ServiceType) -> Option<u32> {
        let cohort = self.cohorts.get_mut(&service)?;
        let seq = cohort.request_seq;
        cohort.request_seq += 1;
        Some(seq)
    }

    /// Ready cohorts whose heartbeat deadline has passed.
    pub fn due_services(&self, at: Instant) -> Vec<ServiceType> {
        self.cohorts
            .iter()
            .filter(|(_, c)| c.ready && c.deadline.expired(at))
            .map(|(&service, _)| service)
            .collect()
    }

    /// Postpone the cohort's heartbeat deadline by one interval.
    pub fn update_timeout(&mut self, service: ServiceType) {
        if let Some(cohort) = self.cohorts.get_mut(&service) {
            cohort.deadline.rearm(self.heartbeat_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(signature: &str, service: ServiceType) -> RegistrationModule {
        RegistrationModule::new(signature, service).unwrap()
    }

    fn db() -> ServiceDatabase {
        ServiceDatabase::new(3, 7000, Duration::from_millis(50))
    }

    #[test]
    fn cohort_ready_after_n_distinct_signatures() {
        let mut db = db();
        assert!(!db.push_registration(&registration("a", 5)).newly_ready);
        assert!(!db.is_ready(5));
        assert!(!db.push_registration(&registration("b", 5)).newly_ready);
        let status = db.push_registration(&registration("c", 5));
        assert!(status.newly_ready);
        assert!(db.is_ready(5));
        assert_eq!(status.dispatch_port, 7000);
    }

    #[test]
    fn duplicate_signature_is_idempotent() {
        let mut db = db();
        let first = db.push_registration(&registration("a", 5));
        let again = db.push_registration(&registration("a", 5));
        assert_eq!(first.dispatch_port, again.dispatch_port);
        assert!(!again.newly_ready);
        db.push_registration(&registration("b", 5));
        assert!(!db.is_ready(5));
        assert!(db.push_registration(&registration("c", 5)).newly_ready);
    }

    #[test]
    fn extra_signature_at_capacity_is_ignored() {
        let mut db = db();
        for sig in ["a", "b", "c"] {
            db.push_registration(&registration(sig, 5));
        }
        let status = db.push_registration(&registration("d", 5));
        assert!(!status.newly_ready);
        assert_eq!(status.dispatch_port, 7000);
        assert!(db.replica_slot(5, b"d").is_none());
        assert_eq!(db.replica_slot(5, b"a"), Some(0));
        assert_eq!(db.replica_slot(5, b"c"), Some(2));
    }

    #[test]
    fn distinct_services_get_distinct_ports() {
        let mut db = db();
        let p1 = db.push_registration(&registration("a", 1)).dispatch_port;
        let p2 = db.push_registration(&registration("a", 2)).dispatch_port;
        assert_eq!(p1, 7000);
        assert_eq!(p2, 7001);
    }

    #[test]
    fn results_accumulate_until_taken() {
        let mut db = db();
        for sig in ["a", "b", "c"] {
            db.push_registration(&registration(sig, 5));
        }
        db.push_request(5, 11);
        assert_eq!(db.push_result(5, 11, 40), Some(1));
        assert_eq!(db.push_result(5, 11, 41), Some(2));
        assert_eq!(db.push_result(5, 11, 42), Some(3));
        assert_eq!(db.take_results(5, 11), Some(vec![40, 41, 42]));
        assert_eq!(db.take_results(5, 11), None);
    }

    #[test]
    fn result_without_pending_request_is_ignored() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        assert_eq!(db.push_result(5, 11, 40), None);
        assert_eq!(db.push_result(9, 11, 40), None);
    }

    #[test]
    fn resubmission_coalesces_by_overwrite() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        db.push_request(5, 11);
        db.push_result(5, 11, 40);
        db.push_result(5, 11, 41);
        // Same client submits again while pending: collected replies reset.
        db.push_request(5, 11);
        assert_eq!(db.push_result(5, 11, 50), Some(1));
        assert_eq!(db.take_results(5, 11), Some(vec![50]));
        assert_eq!(db.pending_count(5), 0);
    }

    #[test]
    fn ping_seq_is_strictly_increasing() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        let seqs: Vec<u32> = (0..4).map(|_| db.next_ping_seq(5).unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(db.next_ping_seq(9).is_none());
    }

    #[test]
    fn first_round_without_pings_marks_nobody_down() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        assert!(db.check_pongs(5).is_empty());
        assert_eq!(db.reliable_count(5), 3);
    }

    #[test]
    fn missed_pong_marks_replica_unreliable() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        db.check_pongs(5); // arm the round
        db.register_pong(5, 0);
        db.register_pong(5, 2);
        assert_eq!(db.check_pongs(5), vec![1]);
        assert_eq!(db.reliable_count(5), 2);
        assert!(!db.is_degraded(5));
    }

    #[test]
    fn pong_restores_reliability() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        db.check_pongs(5);
        assert_eq!(db.check_pongs(5), vec![0, 1, 2]);
        assert!(db.is_degraded(5));
        db.register_pong(5, 1);
        assert_eq!(db.reliable_count(5), 1);
        db.register_pong(5, 0);
        assert!(!db.is_degraded(5));
    }

    #[test]
    fn out_of_range_pong_is_ignored() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        db.register_pong(5, 200);
        db.register_pong(9, 0);
        assert_eq!(db.reliable_count(5), 3);
    }

    #[test]
    fn due_services_follow_deadlines() {
        let mut db = ServiceDatabase::new(1, 7000, Duration::from_millis(10));
        db.push_registration(&registration("a", 5));
        assert!(db.is_ready(5));
        let later = Instant::now() + Duration::from_millis(20);
        assert_eq!(db.due_services(later), vec![5]);
        db.update_timeout(5);
        assert!(db.due_services(Instant::now()).is_empty());
    }

    #[test]
    fn forming_cohort_is_never_due() {
        let mut db = db();
        db.push_registration(&registration("a", 5));
        let later = Instant::now() + Duration::from_secs(60);
        assert!(db.due_services(later).is_empty());
    }
}
