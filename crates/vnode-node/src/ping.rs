//! Provider health pings
//!
//! At most one ping is ever in flight. Concurrent callers of
//! [`Pinger::ping`] share the running ping, and the ping loop drops ticks that
//! arrive while the previous ping is still outstanding. Results are published
//! into a [`Monitor`] so the node control loop reads "did the last ping
//! succeed" without further synchronization.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vnode_common::metrics::{Outcome, NODE_PINGS};
use vnode_common::Error;
use vnode_queue::Monitor;

use crate::provider::NodeProvider;

/// Outcome of one provider ping
#[derive(Clone, Debug)]
pub struct PingResult {
    /// When the ping completed
    pub time: DateTime<Utc>,
    /// Failure, if any
    pub error: Option<Arc<Error>>,
}

impl PingResult {
    /// True when the ping succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

type SharedPing = Shared<BoxFuture<'static, PingResult>>;

/// Single-flight wrapper around [`NodeProvider::ping`]
pub struct Pinger {
    provider: Arc<dyn NodeProvider>,
    timeout: Option<Duration>,
    in_flight: Mutex<Option<SharedPing>>,
    results: Monitor<PingResult>,
}

impl Pinger {
    /// Create a pinger with an optional per-ping timeout
    pub fn new(provider: Arc<dyn NodeProvider>, timeout: Option<Duration>) -> Self {
        Self::with_results(provider, timeout, Monitor::new())
    }

    /// Create a pinger that publishes into an existing monitor
    pub fn with_results(
        provider: Arc<dyn NodeProvider>,
        timeout: Option<Duration>,
        results: Monitor<PingResult>,
    ) -> Self {
        Self {
            provider,
            timeout,
            in_flight: Mutex::new(None),
            results,
        }
    }

    /// Latest ping results
    pub fn results(&self) -> &Monitor<PingResult> {
        &self.results
    }

    /// True while a ping is outstanding
    pub fn in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .is_some_and(|ping| ping.peek().is_none())
    }

    /// Join the running ping or start a new one
    pub fn ping(&self) -> SharedPing {
        let mut slot = self.in_flight.lock();
        if let Some(running) = slot.as_ref() {
            if running.peek().is_none() {
                return running.clone();
            }
        }
        let provider = self.provider.clone();
        let timeout = self.timeout;
        let ping = async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, provider.ping()).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::timeout("ping", limit)),
                },
                None => provider.ping().await,
            };
            PingResult {
                time: Utc::now(),
                error: outcome.err().map(Arc::new),
            }
        }
        .boxed()
        .shared();
        *slot = Some(ping.clone());
        ping
    }

    /// Ping every `interval` until `ctx` is cancelled
    ///
    /// The first ping starts immediately.
    pub async fn run(&self, ctx: CancellationToken, interval: Duration) {
        let mut ticker = interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Option<SharedPing> = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    if pending.is_some() {
                        debug!("Previous ping still running, skipping tick");
                        continue;
                    }
                    pending = Some(self.ping());
                }
                result = async {
                    match pending.as_mut() {
                        Some(ping) => ping.await,
                        None => std::future::pending().await,
                    }
                }, if pending.is_some() => {
                    pending = None;
                    self.publish(result);
                }
            }
        }
    }

    fn publish(&self, result: PingResult) {
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Error
        };
        NODE_PINGS.add(1, &outcome.labels());
        if let Some(err) = &result.error {
            warn!(error = %err, "Provider ping failed");
        }
        self.results.set(result);
    }
}
