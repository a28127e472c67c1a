//! Async facade over a [`SessionPool`].
//!
//! # Responsibilities
//! - Wait for deferred grants under the queue deadline
//! - Hand out [`Lease`]s that always find their way back to the pool
//! - Spawn the relay watcher for every saved session
//!
//! A lease dropped mid-command (client went away) gets its backend command
//! cancelled out of band and the session drained before it is released.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{GatewayError, TimeoutKind};
use crate::protocol::machine;
use crate::relay::sink::PubSubSink;
use crate::relay::watch::watch_idle;
use crate::upstream::pool::{Admission, Checkout, PoolStats, ReleaseOutcome, SavedWatch, SessionPool, Ticket};
use crate::upstream::queue::Grant;
use crate::upstream::session::{BackendSession, SessionState};
use crate::upstream::target::BackendTarget;
use crate::wire::Connector;

#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<Mutex<SessionPool>>,
    target: Arc<BackendTarget>,
}

impl SharedPool {
    pub fn new(target: Arc<BackendTarget>, connector: Arc<dyn Connector>, sink: Option<Arc<dyn PubSubSink>>) -> Self {
        let pool = SessionPool::new(target.clone(), connector, sink);
        Self {
            inner: Arc::new(Mutex::new(pool)),
            target,
        }
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.target
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown();
    }

    /// Acquire a session, waiting in the overflow queue if the policy allows.
    pub async fn acquire(&self) -> Result<Lease, GatewayError> {
        let admission = self.inner.lock().acquire()?;
        let checkout = match admission {
            Admission::Bound(checkout) | Admission::Connecting(checkout) => checkout,
            Admission::Deferred(ticket) => self.wait(ticket).await?,
        };
        Ok(Lease {
            pool: self.clone(),
            checkout: Some(checkout),
        })
    }

    async fn wait(&self, ticket: Ticket) -> Result<Checkout, GatewayError> {
        let Ticket { id, rx, deadline } = ticket;
        let mut pending = PendingGrant {
            pool: self,
            id,
            rx: Some(rx),
        };
        let Some(rx) = pending.rx.as_mut() else {
            return Err(self.exhausted());
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(grant)) => {
                pending.rx = None;
                grant
            }
            Ok(Err(_)) => {
                pending.rx = None;
                Err(self.exhausted())
            }
            Err(_) => {
                let rx = pending.rx.take();
                if self.inner.lock().cancel_waiter(id) {
                    tracing::debug!(pool = %self.target.name, ticket = id, "Queued request expired");
                    return Err(GatewayError::Timeout(TimeoutKind::QueueWait));
                }
                // Granted between the deadline and the cancel.
                match rx.map(|mut rx| rx.try_recv()) {
                    Some(Ok(grant)) => grant,
                    _ => Err(GatewayError::Timeout(TimeoutKind::QueueWait)),
                }
            }
        }
    }

    fn release(&self, checkout: Checkout, outcome: ReleaseOutcome) {
        let released = self.inner.lock().release(checkout, outcome);
        match released {
            Ok(Some(watch)) => self.watch(watch),
            Ok(None) => {}
            Err(e) => tracing::error!(pool = %self.target.name, error = %e, "Session release rejected"),
        }
    }

    fn watch(&self, watch: SavedWatch) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(watch_idle(self.inner.clone(), watch));
            }
            Err(_) => {
                self.inner.lock().discard_saved(watch.id, "no_runtime");
            }
        }
    }

    /// Take back a session whose request went away.
    fn abandon(&self, mut checkout: Checkout) {
        let state = checkout.session().state();
        if state == SessionState::Idle {
            return self.release(checkout, ReleaseOutcome::clean(Vec::new()));
        }
        if !state.has_command_in_flight() {
            return self.release(checkout, ReleaseOutcome::failed());
        }
        let Ok(handle) = Handle::try_current() else {
            return self.release(checkout, ReleaseOutcome::failed());
        };

        tracing::debug!(pool = %self.target.name, state = %state, "Request aborted, cancelling backend command");
        let pool = self.clone();
        let deadline = Instant::now() + self.target.policy.query_timeout;
        handle.spawn(async move {
            let token = match state {
                SessionState::Executing | SessionState::Fetching => checkout.session().conn().cancel_token(),
                _ => None,
            };
            if let Some(token) = token {
                if let Err(e) = token.send().await {
                    tracing::debug!(error = %e, "Cancel request failed");
                }
            }
            let outcome = match machine::drain_to_idle(checkout.session_mut(), deadline).await {
                Ok(()) => ReleaseOutcome::clean(Vec::new()),
                Err(e) => {
                    tracing::debug!(pool = %pool.target.name, error = %e, "Aborted session did not settle");
                    ReleaseOutcome::failed()
                }
            };
            pool.release(checkout, outcome);
        });
    }

    fn exhausted(&self) -> GatewayError {
        GatewayError::PoolExhausted {
            target: self.target.name.clone(),
        }
    }
}

/// Withdraws a queued request if the waiting future is dropped.
struct PendingGrant<'a> {
    pool: &'a SharedPool,
    id: u64,
    rx: Option<oneshot::Receiver<Grant>>,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if self.pool.inner.lock().cancel_waiter(self.id) {
            return;
        }
        if let Ok(Ok(checkout)) = rx.try_recv() {
            self.pool.abandon(checkout);
        }
    }
}

/// A session on loan to one request.
pub struct Lease {
    pool: SharedPool,
    checkout: Option<Checkout>,
}

impl Lease {
    pub fn target(&self) -> &Arc<BackendTarget> {
        self.pool.target()
    }

    pub fn session(&self) -> Option<&BackendSession> {
        self.checkout.as_ref().map(Checkout::session)
    }

    pub fn session_mut(&mut self) -> Option<&mut BackendSession> {
        self.checkout.as_mut().map(Checkout::session_mut)
    }

    pub fn is_fresh(&self) -> bool {
        self.checkout.as_ref().map(Checkout::is_fresh).unwrap_or(false)
    }

    /// Return the session with the request's outcome.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(checkout) = self.checkout.take() {
            self.pool.release(checkout, outcome);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            self.pool.abandon(checkout);
        }
    }
}
