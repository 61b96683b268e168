//! Module that contains the Ricart-Agrawala coordinator every peer runs.
//!
//! A peer enters the critical section once every other peer replied to its
//! request. A peer replies to an inbound request straight away unless it is in
//! the critical section, or it has a pending request of its own that comes
//! first in the `(timestamp, requester)` order; in both cases the reply is held
//! until the local section is over.

use crate::{
    clock::LogicalTimestamp,
    error::{ExclusionError, Violation},
    log,
    message::{PeerId, Reply, Request},
    operation::CriticalSectionRunner,
    sync::{Decision, Gate, Phase, RequestState},
};
use color_print::cformat;
use futures::future::try_join_all;
use std::{collections::BTreeMap, future::Future};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Trait for the RPC handle used to reach another peer.
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> PeerId;

    /// Sends a request and resolves once the peer granted it.
    fn request_access(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Reply, ExclusionError>> + Send;
}

/// Struct that represents the fixed set of peers known at startup.
#[derive(Debug)]
pub struct PeerRegistry<H> {
    peers: BTreeMap<PeerId, H>,
}

impl<H: PeerHandle> PeerRegistry<H> {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
        }
    }

    /// Function that adds a peer, returning the handle it replaced if the id was taken.
    pub fn insert(&mut self, handle: H) -> Option<H> {
        self.peers.insert(handle.id(), handle)
    }

    pub fn get(&self, id: PeerId) -> Option<&H> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &H> + '_ {
        self.peers.values()
    }
}

impl<H: PeerHandle> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: PeerHandle> FromIterator<H> for PeerRegistry<H> {
    fn from_iter<I: IntoIterator<Item = H>>(iter: I) -> Self {
        let mut registry = Self::new();
        for handle in iter {
            registry.insert(handle);
        }
        registry
    }
}

/// Struct that represents the mutual exclusion state machine of one peer.
pub struct Coordinator<H> {
    id: PeerId,
    peers: PeerRegistry<H>,
    state: Mutex<RequestState>,
    // one local entry at a time
    entry: Mutex<()>,
    shutdown: CancellationToken,
}

impl<H: PeerHandle> Coordinator<H> {
    pub fn new(id: PeerId, peers: PeerRegistry<H>) -> Self {
        Self {
            id,
            peers,
            state: Mutex::new(RequestState::new()),
            entry: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn peers(&self) -> &PeerRegistry<H> {
        &self.peers
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase()
    }

    pub async fn now(&self) -> LogicalTimestamp {
        self.state.lock().await.now()
    }

    /// Token cancelled once the coordinator stops taking new entries.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Function that stops accepting new local entries. Inbound requests are still answered.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Function that runs one full local entry: request, wait for every reply, run, release.
    ///
    /// A failed reply aborts the attempt and is returned as is; nothing is retried.
    /// The future must be driven to completion, dropping it half way leaves the
    /// peer marked as requesting.
    pub async fn enter<R: CriticalSectionRunner>(&self, runner: &R) -> Result<(), ExclusionError> {
        if self.is_closed() {
            return Err(ExclusionError::ShuttingDown);
        }
        let _entry = self.entry.lock().await;

        let request = self.begin_request().await?;

        if let Err(e) = self.collect_replies(request).await {
            let mut state = self.state.lock().await;
            let released = state.abort();
            log::error(&cformat!(
                "L({}): <bold>{}</bold> gave up on its request ({released} deferred released): {e}",
                state.now(),
                self.id
            ));
            return Err(e);
        }

        self.enter_section().await?;
        runner.run(self.id).await;
        self.exit_section().await?;

        Ok(())
    }

    async fn begin_request(&self) -> Result<Request, ExclusionError> {
        let timestamp = self.state.lock().await.begin_request()?;
        let request = Request::new(self.id, timestamp);
        log::info(&cformat!(
            "L({timestamp}): <bold>{}</bold> is requesting the critical section from {} peer(s).",
            self.id,
            self.peers.len()
        ));
        Ok(request)
    }

    async fn collect_replies(&self, request: Request) -> Result<(), ExclusionError> {
        try_join_all(self.peers.iter().map(|peer| self.ask(peer, request))).await?;
        Ok(())
    }

    async fn ask(&self, peer: &H, request: Request) -> Result<Reply, ExclusionError> {
        log::debug(&format!("{} sends {request} to {}", self.id, peer.id()));
        let reply = peer.request_access(request).await?;

        if reply.responder != peer.id() {
            return Err(Violation::UnexpectedResponder {
                expected: peer.id(),
                actual: reply.responder,
            }
            .into());
        }

        let now = self.state.lock().await.observe(reply.timestamp)?;
        log::info(&cformat!(
            "L({now}): <bold>{}</bold> got access to the restricted function by <bold>{}</bold>.",
            self.id,
            reply.responder
        ));
        Ok(reply)
    }

    async fn enter_section(&self) -> Result<(), ExclusionError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        log::info(&cformat!(
            "L({}): <bold>{}</bold> <green>entered</green> the critical section.",
            state.now(),
            self.id
        ));
        Ok(())
    }

    async fn exit_section(&self) -> Result<(), ExclusionError> {
        let mut state = self.state.lock().await;
        let released = state.exit()?;
        log::info(&cformat!(
            "L({}): <bold>{}</bold> <yellow>left</yellow> the critical section, releasing {released} deferred peer(s).",
            state.now(),
            self.id
        ));
        Ok(())
    }

    /// Function that answers an inbound request, waiting for as long as the local peer has priority.
    pub async fn handle_request(&self, request: Request) -> Result<Reply, ExclusionError> {
        if request.requester == self.id {
            return Err(Violation::SelfRequest(self.id).into());
        }
        if !self.peers.contains(request.requester) {
            return Err(Violation::UnknownPeer(request.requester).into());
        }

        let mut state = self.state.lock().await;
        let now = state.observe(request.timestamp)?;
        log::info(&cformat!(
            "L({now}): <bold>{}</bold> requests <bold>{}</bold> access to the critical section.",
            request.requester,
            self.id
        ));

        loop {
            match state.decide(self.id, &request)? {
                Decision::Grant => {
                    let reply = Reply::new(self.id, state.now());
                    log::info(&cformat!(
                        "L({}): <bold>{}</bold> gains access to the critical section by <bold>{}</bold>.",
                        reply.timestamp,
                        request.requester,
                        self.id
                    ));
                    return Ok(reply);
                }
                Decision::Defer(gate) => {
                    let wake = state.defer(request)?;
                    match gate {
                        Gate::Busy => log::info(&format!(
                            "L({}): {} is {}, {request} waits.",
                            state.now(),
                            self.id,
                            state.phase()
                        )),
                        Gate::Contention => log::info(&format!(
                            "L({}): request ({}, {}) of {} comes before {request}, which waits.",
                            state.now(),
                            state.request_timestamp(),
                            self.id,
                            self.id
                        )),
                    }
                    drop(state);

                    // the sender only goes away with the state itself
                    if wake.await.is_err() {
                        return Err(ExclusionError::ShuttingDown);
                    }
                    state = self.state.lock().await;
                }
            }
        }
    }
}
