use crate::{
    config::{Config, DialBackoff, TriggerKind},
    coordinator::{Coordinator, PeerHandle, PeerRegistry},
    error::{ExclusionError, Violation},
    log,
    message::{PeerId, Reply, Request, Response},
    operation::{CriticalSectionRunner, RestrictedFunction},
    poisson::Poisson,
    server::Server,
};
use color_print::cformat;
use futures::{
    future::{ready, try_join_all},
    stream::{self, BoxStream},
    SinkExt, Stream, StreamExt,
};
use rand::{rngs::SmallRng, SeedableRng};
use std::{collections::BTreeMap, io, net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::Mutex, time::sleep};
use tokio_util::codec::{Framed, FramedRead, LinesCodec, LinesCodecError};

type Lines = Framed<TcpStream, LinesCodec>;

/// Struct that represents the long-lived connection to another peer.
///
/// The connection is opened on first use (or by [`TcpPeer::connect`]) and
/// reused for every request. A failed exchange drops it.
pub struct TcpPeer {
    id: PeerId,
    address: SocketAddr,
    backoff: DialBackoff,
    connection: Mutex<Option<Lines>>,
}

impl TcpPeer {
    pub fn new(id: PeerId, address: SocketAddr, backoff: DialBackoff) -> Self {
        Self {
            id,
            address,
            backoff,
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Function that makes sure the connection to the peer is open.
    pub async fn connect(&self) -> Result<(), ExclusionError> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.dial().await?);
        }
        Ok(())
    }

    async fn dial(&self) -> Result<Lines, ExclusionError> {
        let mut rng = SmallRng::from_os_rng();
        let mut retries = 0;

        loop {
            log::debug(&format!("Trying to dial {} at {}.", self.id, self.address));
            match TcpStream::connect(self.address).await {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| ExclusionError::transport(self.id, e))?;
                    log::info(&cformat!(
                        "Connected to peer <bold>{}</bold> at {}.",
                        self.id,
                        self.address
                    ));
                    return Ok(Framed::new(stream, LinesCodec::new()));
                }
                Err(e) if retries + 1 < self.backoff.attempts => {
                    let delay = self.backoff.duration(retries, &mut rng);
                    log::debug(&format!(
                        "Couldn't reach {} ({e}), retrying in {delay:?}.",
                        self.id
                    ));
                    sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(ExclusionError::transport(self.id, e)),
            }
        }
    }

    fn codec_error(&self, e: LinesCodecError) -> ExclusionError {
        match e {
            LinesCodecError::Io(e) => ExclusionError::transport(self.id, e),
            other => ExclusionError::transport(
                self.id,
                io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
            ),
        }
    }

    async fn exchange(&self, request: Request) -> Result<Response, ExclusionError> {
        let mut connection = self.connection.lock().await;
        let mut lines = match connection.take() {
            Some(lines) => lines,
            None => self.dial().await?,
        };

        lines
            .send(request.to_json_string()?)
            .await
            .map_err(|e| self.codec_error(e))?;

        match lines.next().await {
            Some(Ok(line)) => {
                let response = Response::from_json_string(&line)?;
                *connection = Some(lines);
                Ok(response)
            }
            Some(Err(e)) => Err(self.codec_error(e)),
            None => Err(ExclusionError::transport(
                self.id,
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
            )),
        }
    }
}

impl PeerHandle for TcpPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    async fn request_access(&self, request: Request) -> Result<Reply, ExclusionError> {
        match self.exchange(request).await? {
            Response::Granted(reply) => Ok(reply),
            Response::Refused(reason) => Err(Violation::Refused {
                peer: self.id,
                reason,
            }
            .into()),
        }
    }
}

/// Struct that represents the static list of peers of the cluster.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    addresses: BTreeMap<PeerId, SocketAddr>,
    backoff: DialBackoff,
}

impl PeerDirectory {
    pub fn new(addresses: BTreeMap<PeerId, SocketAddr>, backoff: DialBackoff) -> Self {
        Self { addresses, backoff }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.peer_addresses(), config.dial_backoff())
    }

    /// Function that builds one handle per peer. Nothing is dialled yet.
    pub fn resolve(&self) -> PeerRegistry<TcpPeer> {
        self.addresses
            .iter()
            .map(|(id, address)| TcpPeer::new(*id, *address, self.backoff.clone()))
            .collect()
    }
}

/// Function that dials every peer of the registry.
pub async fn connect_all(registry: &PeerRegistry<TcpPeer>) -> Result<(), ExclusionError> {
    try_join_all(registry.iter().map(TcpPeer::connect)).await?;
    Ok(())
}

/// Struct that represents the source of "enter the critical section" signals.
pub struct EntryTrigger {
    entries: BoxStream<'static, ()>,
}

impl EntryTrigger {
    pub fn from_stream(entries: impl Stream<Item = ()> + Send + 'static) -> Self {
        Self {
            entries: entries.boxed(),
        }
    }

    /// One entry for every line typed on stdin.
    pub fn stdin() -> Self {
        Self::from_stream(
            FramedRead::new(tokio::io::stdin(), LinesCodec::new())
                .take_while(|line| ready(line.is_ok()))
                .map(|_| ()),
        )
    }

    /// Entries at the arrival times of a Poisson process.
    pub fn poisson(poisson: Poisson<SmallRng>) -> Self {
        Self::from_stream(stream::unfold(poisson, |mut poisson| async move {
            sleep(poisson.delay_for_next_event()).await;
            Some(((), poisson))
        }))
    }

    pub fn from_config(config: &Config) -> Self {
        let trigger = match config.trigger {
            TriggerKind::Stdin => Self::stdin(),
            TriggerKind::Poisson => Self::poisson(Poisson::new(config.rate, config.seed())),
        };
        match config.entries {
            Some(limit) => trigger.limit(limit),
            None => trigger,
        }
    }

    pub fn limit(self, limit: usize) -> Self {
        Self::from_stream(self.entries.take(limit))
    }

    pub async fn next(&mut self) -> Option<()> {
        self.entries.next().await
    }
}

/// Function that enters the critical section once per trigger until the trigger
/// runs dry or the coordinator is closed. Returns the number of entries.
pub async fn drive<H, R>(
    coordinator: &Coordinator<H>,
    mut trigger: EntryTrigger,
    runner: &R,
) -> Result<usize, ExclusionError>
where
    H: PeerHandle,
    R: CriticalSectionRunner,
{
    let shutdown = coordinator.shutdown_token();
    let mut entries = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            next = trigger.next() => next,
        };
        if next.is_none() {
            break;
        }
        coordinator.enter(runner).await?;
        entries += 1;
    }

    Ok(entries)
}

/// Enum that represents what an interrupt from the terminal does to a running peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Stop taking entries and let in-flight requests finish.
    Close,
    /// Leave at once.
    ForceExit,
}

impl Interrupt {
    /// Exit status of a forced exit, as a shell reports death by `SIGINT`.
    pub const EXIT_CODE: i32 = 130;

    /// Function that returns the action for the `received`-th interrupt, counting from 1.
    pub fn after(received: usize) -> Self {
        if received <= 1 {
            Self::Close
        } else {
            Self::ForceExit
        }
    }
}

/// Struct that represents a whole peer process.
pub struct Peer {
    pub config: Config,
}

impl Peer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), ExclusionError> {
        self.config.validate()?;

        let id = self.config.own_id();
        let registry = PeerDirectory::from_config(&self.config).resolve();
        let coordinator = Arc::new(Coordinator::new(id, registry));
        let shutdown = coordinator.shutdown_token();

        let server = Server::bind(self.config.listen_address(), Arc::clone(&coordinator)).await?;
        let server_thread = tokio::spawn(server.run(shutdown.clone(), self.config.shutdown_grace()));

        let signal_thread = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let mut received = 0;
                while tokio::signal::ctrl_c().await.is_ok() {
                    received += 1;
                    match Interrupt::after(received) {
                        Interrupt::Close => {
                            log::info("Exiting gracefully... (interrupt again to force)");
                            coordinator.close();
                        }
                        Interrupt::ForceExit => {
                            log::warn("Interrupted twice, exiting now.");
                            std::process::exit(Interrupt::EXIT_CODE);
                        }
                    }
                }
            })
        };

        let result = Self::serve(&self.config, &coordinator).await;
        coordinator.close();

        match server_thread.await {
            Ok(Err(e)) => log::error(&format!("Server failed: {e}")),
            Err(e) => log::error(&format!("Server thread failed: {e}")),
            Ok(Ok(())) => {}
        }
        // a second interrupt may still cut the grace period short
        signal_thread.abort();

        if let Err(e) = &result {
            log::error(&cformat!("<red, bold>FATAL ERROR</red, bold>: {e}"));
        }
        result
    }

    async fn serve(config: &Config, coordinator: &Coordinator<TcpPeer>) -> Result<(), ExclusionError> {
        let shutdown = coordinator.shutdown_token();

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect_all(coordinator.peers()) => connected?,
        }
        log::info(&cformat!(
            "<bold>{}</bold> connected to all {} peer(s).",
            coordinator.id(),
            coordinator.peers().len()
        ));

        let runner = RestrictedFunction::new(config.section_steps, config.step_interval());
        let entries = drive(coordinator, EntryTrigger::from_config(config), &runner).await?;

        if !shutdown.is_cancelled() {
            log::info(&format!(
                "No more entries after {entries}, still answering requests until interrupted."
            ));
            shutdown.cancelled().await;
        }
        Ok(())
    }
}
