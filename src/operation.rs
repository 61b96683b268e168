//! Module that contains the work a peer performs while it holds the critical section.

use crate::{log, message::PeerId};
use color_print::cformat;
use std::{future::Future, time::Duration};
use tokio::time::sleep;

/// Trait for the body of the critical section.
///
/// The coordinator runs it only after every other peer replied and waits for
/// it to finish before releasing the section.
pub trait CriticalSectionRunner: Send + Sync {
    fn run(&self, own_id: PeerId) -> impl Future<Output = ()> + Send;
}

/// Struct that represents the default restricted function: it logs its progress for a while.
#[derive(Debug, Clone)]
pub struct RestrictedFunction {
    pub steps: u32,
    pub step_interval: Duration,
}

impl RestrictedFunction {
    pub fn new(steps: u32, step_interval: Duration) -> Self {
        Self {
            steps,
            step_interval,
        }
    }
}

impl Default for RestrictedFunction {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

impl CriticalSectionRunner for RestrictedFunction {
    async fn run(&self, own_id: PeerId) {
        log::info(&cformat!(
            "<red, bold>RESTRICTED ACCESS</red, bold> by <bold>{own_id}</bold>."
        ));
        for step in 1..=self.steps {
            sleep(self.step_interval).await;
            log::info(&cformat!(
                "<bold>{own_id}</bold> is working ({step}/{}).",
                self.steps
            ));
        }
        log::info(&cformat!("Access by <bold>{own_id}</bold> complete."));
    }
}
