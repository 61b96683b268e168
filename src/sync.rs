//! Module that contains the state a peer keeps about its own use of the critical section.
//!
//! Both the local entry path and the inbound request handlers touch this state,
//! so the coordinator keeps it behind a single lock. Handlers that have to wait
//! register a wake-up here while holding that lock and await it after releasing it.

use crate::{
    clock::{LogicalClock, LogicalTimestamp},
    error::Violation,
    message::{PeerId, Request},
};
use std::{collections::BTreeMap, fmt};
use tokio::sync::oneshot;

/// Enum that represents where a peer is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    InSection,
}

/// Enum that represents the reason a reply is being held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The local peer is inside the critical section.
    Busy,
    /// The local peer has a pending request that comes first.
    Contention,
}

/// Enum that represents what to do with an inbound request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Grant,
    Defer(Gate),
}

/// Struct that represents the local view of the critical section.
#[derive(Debug)]
pub struct RequestState {
    clock: LogicalClock,
    requesting: bool,
    using: bool,
    request_timestamp: LogicalTimestamp,
    deferred: BTreeMap<Request, oneshot::Sender<()>>,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            clock: LogicalClock::new(),
            requesting: false,
            using: false,
            request_timestamp: LogicalTimestamp::START,
            deferred: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.requesting, self.using) {
            (_, true) => Phase::InSection,
            (true, false) => Phase::Requesting,
            (false, false) => Phase::Idle,
        }
    }

    pub fn now(&self) -> LogicalTimestamp {
        self.clock.now()
    }

    /// Timestamp of the current (or last) local request.
    pub fn request_timestamp(&self) -> LogicalTimestamp {
        self.request_timestamp
    }

    /// Requests currently waiting for a reply from this peer, in priority order.
    pub fn deferred(&self) -> impl Iterator<Item = Request> + '_ {
        self.deferred.keys().copied()
    }

    /// Function that advances the clock past the timestamp of an inbound message.
    pub fn observe(&mut self, remote: LogicalTimestamp) -> Result<LogicalTimestamp, Violation> {
        self.clock.observe(remote)
    }

    /// Function that starts a local request and returns its timestamp.
    pub fn begin_request(&mut self) -> Result<LogicalTimestamp, Violation> {
        if self.phase() != Phase::Idle {
            return Err(Violation::NotIdle);
        }
        self.request_timestamp = self.clock.tick()?;
        self.requesting = true;
        Ok(self.request_timestamp)
    }

    /// Function that decides whether an inbound request can be granted at this moment.
    pub fn decide(&self, own_id: PeerId, request: &Request) -> Result<Decision, Violation> {
        if self.using {
            return Ok(Decision::Defer(Gate::Busy));
        }
        if !self.requesting {
            return Ok(Decision::Grant);
        }

        let own = Request::new(own_id, self.request_timestamp);
        if *request == own {
            return Err(Violation::DuplicateRequest(*request));
        }
        if request.precedes(&own) {
            Ok(Decision::Grant)
        } else {
            Ok(Decision::Defer(Gate::Contention))
        }
    }

    /// Function that parks an inbound request until the local state changes.
    ///
    /// The receiver resolves once the local request is finished or abandoned.
    /// Each pending request gets its own wake-up, so one requester may have
    /// several of them parked at once; the same request twice is a violation.
    pub fn defer(&mut self, request: Request) -> Result<oneshot::Receiver<()>, Violation> {
        if self.deferred.contains_key(&request) {
            return Err(Violation::DuplicateRequest(request));
        }
        let (tx, rx) = oneshot::channel();
        self.deferred.insert(request, tx);
        Ok(rx)
    }

    /// Function that moves from requesting to using the critical section.
    pub fn enter(&mut self) -> Result<(), Violation> {
        if self.phase() != Phase::Requesting {
            return Err(Violation::NotRequesting);
        }
        self.requesting = false;
        self.using = true;
        Ok(())
    }

    /// Function that leaves the critical section and wakes every deferred requester.
    pub fn exit(&mut self) -> Result<usize, Violation> {
        if self.phase() != Phase::InSection {
            return Err(Violation::NotInSection);
        }
        self.using = false;
        Ok(self.release_deferred())
    }

    /// Function that abandons a pending request that will never be granted.
    pub fn abort(&mut self) -> usize {
        self.requesting = false;
        self.release_deferred()
    }

    fn release_deferred(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let released = deferred.len();
        for (_, wake) in deferred {
            // the handler may have been cancelled with its connection
            let _ = wake.send(());
        }
        released
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("IDLE"),
            Self::Requesting => f.write_str("REQUESTING"),
            Self::InSection => f.write_str("IN_SECTION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requester: u64, timestamp: u64) -> Request {
        Request::new(PeerId(requester), LogicalTimestamp(timestamp))
    }

    const ME: PeerId = PeerId(5000);

    #[test]
    fn starts_idle() {
        let state = RequestState::new();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.now(), LogicalTimestamp(1));
    }

    #[test]
    fn idle_peer_grants() {
        let state = RequestState::new();
        assert_eq!(state.decide(ME, &request(5001, 2)), Ok(Decision::Grant));
    }

    #[test]
    fn cycle_through_phases() {
        let mut state = RequestState::new();
        assert_eq!(state.begin_request(), Ok(LogicalTimestamp(2)));
        assert_eq!(state.phase(), Phase::Requesting);
        assert_eq!(state.begin_request(), Err(Violation::NotIdle));

        state.enter().unwrap();
        assert_eq!(state.phase(), Phase::InSection);
        assert_eq!(state.enter(), Err(Violation::NotRequesting));

        assert_eq!(state.exit(), Ok(0));
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.exit(), Err(Violation::NotInSection));
    }

    #[test]
    fn busy_peer_defers_everyone() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        state.enter().unwrap();
        assert_eq!(
            state.decide(ME, &request(5001, 1)),
            Ok(Decision::Defer(Gate::Busy))
        );
    }

    #[test]
    fn contention_uses_total_order() {
        let mut state = RequestState::new();
        assert_eq!(state.begin_request(), Ok(LogicalTimestamp(2)));

        // (2, 5000) comes before (2, 5001)
        assert_eq!(
            state.decide(ME, &request(5001, 2)),
            Ok(Decision::Defer(Gate::Contention))
        );
        assert_eq!(
            state.decide(ME, &request(5002, 5)),
            Ok(Decision::Defer(Gate::Contention))
        );
        assert_eq!(state.decide(ME, &request(4999, 2)), Ok(Decision::Grant));
        assert_eq!(state.decide(ME, &request(5001, 1)), Ok(Decision::Grant));
    }

    #[test]
    fn identical_request_is_a_violation() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        let clash = request(5000, 2);
        assert_eq!(
            state.decide(ME, &clash),
            Err(Violation::DuplicateRequest(clash))
        );
    }

    #[test]
    fn exit_wakes_deferred_requesters() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        let mut first = state.defer(request(5001, 3)).unwrap();
        let mut second = state.defer(request(5002, 3)).unwrap();
        assert_eq!(state.deferred().count(), 2);

        state.enter().unwrap();
        assert!(first.try_recv().is_err());

        assert_eq!(state.exit(), Ok(2));
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
        assert_eq!(state.deferred().count(), 0);
    }

    #[test]
    fn abort_releases_and_returns_to_idle() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        let mut waiting = state.defer(request(5002, 3)).unwrap();

        assert_eq!(state.abort(), 1);
        assert_eq!(state.phase(), Phase::Idle);
        assert!(waiting.try_recv().is_ok());
        assert_eq!(state.decide(ME, &request(5002, 3)), Ok(Decision::Grant));
    }

    #[test]
    fn one_requester_can_have_several_requests_parked() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        let mut older = state.defer(request(5001, 10)).unwrap();
        let mut newer = state.defer(request(5001, 11)).unwrap();
        assert_eq!(
            state.deferred().collect::<Vec<_>>(),
            vec![request(5001, 10), request(5001, 11)]
        );

        // registering the newer one must not cancel the older one
        assert!(matches!(
            older.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        assert_eq!(state.abort(), 2);
        assert!(older.try_recv().is_ok());
        assert!(newer.try_recv().is_ok());
    }

    #[test]
    fn same_inbound_request_twice_is_a_violation() {
        let mut state = RequestState::new();
        state.begin_request().unwrap();
        let repeated = request(5001, 4);
        let mut parked = state.defer(repeated).unwrap();

        assert_eq!(
            state.defer(repeated).map(|_| ()),
            Err(Violation::DuplicateRequest(repeated))
        );
        assert_eq!(state.deferred().count(), 1);
        assert!(matches!(
            parked.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn overflowing_clock_leaves_the_peer_idle() {
        let mut state = RequestState::new();
        state.observe(LogicalTimestamp(u64::MAX - 1)).unwrap();
        assert_eq!(
            state.begin_request(),
            Err(Violation::ClockOverflow(LogicalTimestamp(0)))
        );
        assert_eq!(state.phase(), Phase::Idle);
    }
}
