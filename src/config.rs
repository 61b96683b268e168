//! Command line configuration of a peer.

use crate::{error::ExclusionError, message::PeerId, RATE};
use clap::{Parser, ValueEnum};
use rand::Rng;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// A peer taking part in Ricart-Agrawala mutual exclusion.
///
/// Every peer listens on its own port and uses that port as its identifier.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// The port this peer listens on, also used as its identifier.
    #[arg(long, short = 'p', env = "PEER_PORT", default_value_t = 5000)]
    pub port: u16,
    /// The host every peer of the cluster listens on.
    #[arg(long, env = "PEER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
    /// Ports of all peers of the cluster. The own port may be included.
    #[arg(long, env = "PEER_CLUSTER", value_delimiter = ',', default_value = "5000,5001,5002")]
    pub peers: Vec<u16>,
    /// What makes this peer ask for the critical section.
    #[arg(long, value_enum, default_value_t = TriggerKind::Stdin)]
    pub trigger: TriggerKind,
    /// Mean number of automatic entries per second with `--trigger poisson`.
    #[arg(long, default_value_t = RATE)]
    pub rate: f64,
    /// Seed of the automatic trigger. Defaults to the port.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Stop after this many entries.
    #[arg(long)]
    pub entries: Option<usize>,
    /// Number of progress steps of the restricted function.
    #[arg(long, default_value_t = 5)]
    pub section_steps: u32,
    /// Duration of each progress step, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub step_millis: u64,
    /// First delay between two dial attempts, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub dial_initial_millis: u64,
    /// Longest delay between two dial attempts, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub dial_max_millis: u64,
    /// Number of dial attempts per peer before giving up.
    #[arg(long, default_value_t = 30)]
    pub dial_attempts: u32,
    /// How long in-flight requests may take to finish after a shutdown signal, in seconds.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,
    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
    /// Write the log to `peer_<port>.log` in this directory instead of stdout.
    #[arg(long, env = "PEER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TriggerKind {
    /// One entry per line read from stdin.
    Stdin,
    /// Entries at random intervals.
    Poisson,
}

impl Config {
    /// Function that checks the values that `clap` cannot check on its own.
    pub fn validate(&self) -> Result<(), ExclusionError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(ExclusionError::Config(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if self.dial_attempts == 0 {
            return Err(ExclusionError::Config("dial attempts must be at least 1".into()));
        }
        if self.dial_initial_millis > self.dial_max_millis {
            return Err(ExclusionError::Config(
                "initial dial delay is longer than the maximum one".into(),
            ));
        }
        let mut seen = self.peers.clone();
        seen.sort_unstable();
        if seen.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ExclusionError::Config(format!(
                "duplicate port in cluster {:?}",
                self.peers
            )));
        }
        Ok(())
    }

    pub fn own_id(&self) -> PeerId {
        PeerId::from(self.port)
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Addresses of every other peer, keyed by identifier.
    pub fn peer_addresses(&self) -> BTreeMap<PeerId, SocketAddr> {
        self.peers
            .iter()
            .filter(|port| **port != self.port)
            .map(|port| (PeerId::from(*port), SocketAddr::new(self.host, *port)))
            .collect()
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(self.port as u64)
    }

    /// File the log goes to, if the peer logs to a file at all.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("peer_{}.log", self.port)))
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn dial_backoff(&self) -> DialBackoff {
        DialBackoff {
            initial: Duration::from_millis(self.dial_initial_millis),
            max: Duration::from_millis(self.dial_max_millis),
            multiplier: 2.0,
            attempts: self.dial_attempts,
        }
    }
}

/// Configuration for exponential backoff with jitter while dialing peers.
#[derive(Debug, Clone)]
pub struct DialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub attempts: u32,
}

impl Default for DialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            attempts: 30,
        }
    }
}

impl DialBackoff {
    /// Calculate the delay before retry number `retries` (starting at 0), with jitter.
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        // 50% to 150% of the capped delay
        let jitter = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}
