//! Scheduler loop driver.
//!
//! Each pipeline stage is a struct implementing [`Scheduler`]; [`run_scheduler`]
//! drives it until cancelled. A tick either did work, and the next tick
//! follows immediately, or found nothing, and the loop sleeps for the
//! stage's poll interval. Idle/active transitions are logged once each.

pub mod build;
pub mod embedding;
pub mod extraction;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kg::error::Result;

pub use build::BuildScheduler;
pub use embedding::{EmbeddingPhase, EmbeddingScheduler};
pub use extraction::ExtractionScheduler;

/// Outcome of one scheduler cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Work was done; poll again right away.
    Worked,
    /// Nothing to do.
    Idle,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    fn poll_interval(&self) -> Duration;

    /// Runs once before the first tick.
    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    async fn tick(&self) -> Result<Tick>;
}

/// Drive `scheduler` until `cancel` fires.
///
/// Errors never escape: a failed tick is logged and retried after the poll
/// interval.
pub async fn run_scheduler(scheduler: Arc<dyn Scheduler>, cancel: CancellationToken) {
    let name = scheduler.name();
    let interval = scheduler.poll_interval();

    if let Err(e) = scheduler.startup().await {
        error!(scheduler = name, error = %e, "Startup sweep failed");
    }
    info!(scheduler = name, poll_ms = interval.as_millis() as u64, "Scheduler started");

    let mut active = false;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let pause = match scheduler.tick().await {
            Ok(Tick::Worked) => {
                if !active {
                    info!(scheduler = name, "Scheduler active");
                    active = true;
                }
                None
            }
            Ok(Tick::Idle) => {
                if active {
                    info!(scheduler = name, "Scheduler idle");
                    active = false;
                }
                Some(interval)
            }
            Err(e) => {
                warn!(
                    scheduler = name,
                    error = %e,
                    connectivity = e.is_connectivity(),
                    "Scheduler cycle failed"
                );
                Some(interval)
            }
        };

        match pause {
            Some(duration) => {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(duration) => {}
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    info!(scheduler = name, "Scheduler stopped");
}
