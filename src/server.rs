use crate::{
    coordinator::{Coordinator, PeerHandle},
    error::ExclusionError,
    log,
    message::{Request, Response},
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
    task::TaskTracker,
};

/// Struct that represents the RPC endpoint through which other peers ask for access.
pub struct Server<H> {
    listener: TcpListener,
    coordinator: Arc<Coordinator<H>>,
    tracker: TaskTracker,
}

impl<H: PeerHandle + 'static> Server<H> {
    pub async fn bind(
        address: SocketAddr,
        coordinator: Arc<Coordinator<H>>,
    ) -> Result<Self, ExclusionError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self::from_listener(listener, coordinator))
    }

    pub fn from_listener(listener: TcpListener, coordinator: Arc<Coordinator<H>>) -> Self {
        Self {
            listener,
            coordinator,
            tracker: TaskTracker::new(),
        }
    }

    pub fn local_address(&self) -> Result<SocketAddr, ExclusionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Function that answers one request line.
    async fn respond(coordinator: &Coordinator<H>, line: &str) -> Response {
        let request = match Request::from_json_string(line) {
            Ok(request) => request,
            Err(e) => {
                log::warn(&format!("Received a malformed request: {e}"));
                return Response::Refused(format!("The request had incorrect formatting: {e}"));
            }
        };

        match coordinator.handle_request(request).await {
            Ok(reply) => Response::Granted(reply),
            Err(ExclusionError::InvariantViolation(violation)) => {
                log::error(&cformat!(
                    "<red>Refusing</red> {request}: <bold>{violation}</bold>."
                ));
                Response::Refused(violation.to_string())
            }
            Err(e) => {
                log::error(&format!("Failed to handle {request}: {e}"));
                Response::Refused(e.to_string())
            }
        }
    }

    async fn handle(
        stream: TcpStream,
        address: SocketAddr,
        coordinator: Arc<Coordinator<H>>,
        shutdown: CancellationToken,
    ) -> Result<(), ExclusionError> {
        let mut lines = Framed::new(stream, LinesCodec::new());

        loop {
            // a request already read is always answered, even during shutdown
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next() => line,
            };

            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    log::warn(&format!("Dropping connection from {address}: {e}"));
                    break;
                }
                None => break,
            };

            let response = Self::respond(&coordinator, &line).await;
            lines.send(response.to_json_string()?).await.map_err(|e| {
                ExclusionError::Io(std::io::Error::other(format!(
                    "couldn't answer {address}: {e}"
                )))
            })?;
        }

        log::debug(&format!("Connection from {address} closed."));
        Ok(())
    }

    /// Function that accepts connections until `shutdown` is cancelled.
    ///
    /// Once cancelled the listener is released and the connections that are
    /// answering a request get up to `grace` to send their reply.
    pub async fn run(self, shutdown: CancellationToken, grace: Duration) -> Result<(), ExclusionError> {
        log::info(&cformat!(
            "<bold>{}</bold> is listening on <bold>{}</bold>.",
            self.coordinator.id(),
            self.local_address()?
        ));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, address) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn(&format!("Failed to accept a connection: {e}"));
                    continue;
                }
            };
            log::debug(&format!("Accepted a connection from {address}."));

            let coordinator = Arc::clone(&self.coordinator);
            let shutdown = shutdown.clone();
            self.tracker.spawn(async move {
                if let Err(e) = Self::handle(stream, address, coordinator, shutdown).await {
                    log::error(&format!("{e}"));
                }
            });
        }

        drop(self.listener);
        self.tracker.close();
        if timeout(grace, self.tracker.wait()).await.is_err() {
            log::warn(&format!(
                "{} request(s) still deferred after the grace period, leaving them behind.",
                self.tracker.len()
            ));
        }
        log::info("Server stopped.");
        Ok(())
    }
}

