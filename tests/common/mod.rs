#![allow(dead_code)]

use peer_exclusion::{
    Coordinator, CriticalSectionRunner, ExclusionError, PeerHandle, PeerId, Reply, Request,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};
use tokio::time::sleep;

/// Initialize tracing for tests. Keep the guard alive for the whole test.
/// Uses RUST_LOG env var for filtering (defaults to "peer_exclusion=debug").
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peer_exclusion=debug")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

type Members = BTreeMap<PeerId, Arc<Coordinator<LocalPeer>>>;

/// Handle that delivers requests to a coordinator of the same process.
pub struct LocalPeer {
    id: PeerId,
    latency: Duration,
    members: Arc<OnceLock<Members>>,
}

impl PeerHandle for LocalPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    async fn request_access(&self, request: Request) -> Result<Reply, ExclusionError> {
        sleep(self.latency).await;
        let target = self
            .members
            .get()
            .and_then(|members| members.get(&self.id))
            .cloned()
            .expect("cluster is wired before any request");
        target.handle_request(request).await
    }
}

/// In-process cluster where every peer reaches every other one through [`LocalPeer`].
pub struct Cluster {
    members: Arc<OnceLock<Members>>,
}

impl Cluster {
    /// Builds a cluster; `latency(from, to)` is the delivery delay of requests from `from` to `to`.
    pub fn new(ids: &[u64], latency: impl Fn(PeerId, PeerId) -> Duration) -> Self {
        let shared = Arc::new(OnceLock::new());
        let members: Members = ids
            .iter()
            .map(|own| {
                let own = PeerId(*own);
                let handles = ids
                    .iter()
                    .map(|other| PeerId(*other))
                    .filter(|other| *other != own)
                    .map(|other| LocalPeer {
                        id: other,
                        latency: latency(own, other),
                        members: Arc::clone(&shared),
                    })
                    .collect();
                (own, Arc::new(Coordinator::new(own, handles)))
            })
            .collect();
        assert!(shared.set(members).is_ok());
        Self { members: shared }
    }

    pub fn uniform(ids: &[u64], latency: Duration) -> Self {
        Self::new(ids, |_, _| latency)
    }

    pub fn peer(&self, id: u64) -> Arc<Coordinator<LocalPeer>> {
        Arc::clone(&self.members.get().unwrap()[&PeerId(id)])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Enter(PeerId),
    Exit(PeerId),
}

/// Critical section body that records who was inside and checks nobody overlaps.
#[derive(Clone, Default)]
pub struct Recorder {
    pub hold: Duration,
    events: Arc<Mutex<Vec<Event>>>,
    inside: Arc<AtomicUsize>,
    most_inside: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn most_inside(&self) -> usize {
        self.most_inside.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<PeerId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Enter(id) => Some(id),
                Event::Exit(_) => None,
            })
            .collect()
    }
}

impl CriticalSectionRunner for Recorder {
    async fn run(&self, own_id: PeerId) {
        let now_inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.most_inside.fetch_max(now_inside, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::Enter(own_id));

        sleep(self.hold).await;

        self.events.lock().unwrap().push(Event::Exit(own_id));
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }
}
