//! Periodic background tasks.
//!
//! Each task runs its work, sleeps for the current period and repeats until
//! cancelled. A failed or panicking iteration is logged and the next one runs
//! on schedule; nothing short of cancellation ends the loop.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkherd_common::protocol::error::Result;

/// A named repeating task.
pub struct Activity {
    name: &'static str,
    nudge: Option<Arc<Notify>>,
    run_immediately: bool,
}

impl Activity {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            nudge: None,
            run_immediately: true,
        }
    }

    /// Lets `notify` cut the current sleep short.
    pub fn nudged_by(mut self, notify: Arc<Notify>) -> Self {
        self.nudge = Some(notify);
        self
    }

    /// Sleep one period before the first run.
    pub fn delay_first_run(mut self) -> Self {
        self.run_immediately = false;
        self
    }

    /// Spawns the loop.
    ///
    /// `period` is re-evaluated after every run, so the interval follows
    /// config changes.
    pub fn spawn<P, F, Fut>(
        self,
        cancel: CancellationToken,
        period: P,
        work: F,
    ) -> JoinHandle<()>
    where
        P: Fn() -> Duration + Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let Activity {
            name,
            nudge,
            run_immediately,
        } = self;

        tokio::spawn(async move {
            info!("Starting {}", name);
            let mut first = true;

            loop {
                if !first || run_immediately {
                    match AssertUnwindSafe(work()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("{} failed: {}", name, e),
                        Err(_) => error!("{} panicked", name),
                    }
                }
                first = false;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period()) => {}
                    _ = nudged(nudge.as_deref()) => debug!("{} woken early", name),
                }
            }

            info!("Stopped {}", name);
        })
    }
}

async fn nudged(nudge: Option<&Notify>) {
    match nudge {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
