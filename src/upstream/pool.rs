//! Per-target session pool.
//!
//! # Responsibilities
//! - Own every backend session of one target in a fixed arena of slots
//! - Admit requests: reuse a saved session, connect into a free slot,
//!   defer into the overflow queue, or reject
//! - Reclaim sessions: hand over to a waiter, save for reuse, or destroy
//! - Keep LISTEN registrations alive across evictions
//!
//! Slots are addressed by [`SessionId`]; the generation changes on every
//! ownership transfer so stale handles are detected instead of acted upon.
//! The pool is synchronous; callers share it behind a mutex and never hold
//! the lock across an await.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::observability::metrics;
use crate::relay::drain;
use crate::relay::sink::PubSubSink;
use crate::upstream::listen::ListenRegistration;
use crate::upstream::queue::{Grant, OverflowQueue, Waiter};
use crate::upstream::session::{BackendSession, SessionState};
use crate::upstream::target::BackendTarget;
use crate::wire::{ConnStatus, Connector, Interest, Readiness, TransactionStatus};

/// Stable handle of a slot plus the generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: usize,
    generation: u64,
}

impl SessionId {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A session bound to a request. The pool keeps the slot reserved until the
/// checkout comes back through [`SessionPool::release`].
#[derive(Debug)]
pub struct Checkout {
    id: SessionId,
    session: BackendSession,
    fresh: bool,
}

impl Checkout {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session(&self) -> &BackendSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BackendSession {
        &mut self.session
    }

    /// True when the session was opened for this request.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

/// A deferred acquisition waiting in the overflow queue.
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    pub rx: oneshot::Receiver<Grant>,
    pub deadline: Instant,
}

#[derive(Debug)]
pub enum Admission {
    /// Reused a saved session, no connection setup needed.
    Bound(Checkout),
    /// New connection started; the handshake is still pending.
    Connecting(Checkout),
    Deferred(Ticket),
}

/// How the request that held a session ended.
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    /// False after any error that leaves the session unusable.
    pub reusable: bool,
    pub listens: Vec<ListenRegistration>,
}

impl ReleaseOutcome {
    pub fn clean(listens: Vec<ListenRegistration>) -> Self {
        Self { reusable: true, listens }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

/// Everything the relay watcher needs for a newly saved session.
pub struct SavedWatch {
    pub id: SessionId,
    pub readiness: Arc<dyn Readiness>,
    /// Fires (closes) when the session leaves the saved set.
    pub stop: oneshot::Receiver<()>,
    /// Asks for a relay pass without waiting for readiness.
    pub wake: Arc<Notify>,
    pub deadline: Instant,
    pub interest: Interest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Continue(Interest),
    /// The session failed and was destroyed.
    Closed,
    /// The session is no longer saved under this id.
    Gone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub saved: usize,
    pub free: usize,
    pub queued: usize,
}

struct SavedSession {
    session: BackendSession,
    /// Held only so that dropping it stops the watcher.
    _stop: oneshot::Sender<()>,
    wake: Arc<Notify>,
}

enum Slot {
    Free,
    Active,
    Saved(SavedSession),
}

struct SlotEntry {
    generation: u64,
    slot: Slot,
}

pub struct SessionPool {
    target: Arc<BackendTarget>,
    connector: Arc<dyn Connector>,
    sink: Option<Arc<dyn PubSubSink>>,
    slots: Vec<SlotEntry>,
    free: Vec<usize>,
    /// Front is the least recently saved.
    saved: VecDeque<usize>,
    queue: OverflowQueue,
    terminating: bool,
}

impl SessionPool {
    pub fn new(target: Arc<BackendTarget>, connector: Arc<dyn Connector>, sink: Option<Arc<dyn PubSubSink>>) -> Self {
        let max = target.policy.max_sessions;
        let slots = (0..max)
            .map(|_| SlotEntry {
                generation: 0,
                slot: Slot::Free,
            })
            .collect();
        Self {
            target,
            connector,
            sink,
            slots,
            free: (0..max).rev().collect(),
            saved: VecDeque::new(),
            queue: OverflowQueue::new(),
            terminating: false,
        }
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.target
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.slots.iter().filter(|e| matches!(e.slot, Slot::Active)).count(),
            saved: self.saved.len(),
            free: self.free.len(),
            queued: self.queue.len(),
        }
    }

    /// Admit a request.
    pub fn acquire(&mut self) -> Result<Admission, GatewayError> {
        if self.terminating {
            metrics::record_pool_acquire(&self.target.name, "rejected");
            return Err(self.exhausted());
        }

        while let Some(index) = self.saved.pop_back() {
            let Some(session) = self.take_saved(index) else {
                continue;
            };
            if session.addr() != self.target.addr {
                tracing::error!(
                    pool = %self.target.name,
                    addr = %session.addr(),
                    "Saved session does not belong to this target"
                );
                self.destroy(index, session, "address_mismatch");
                continue;
            }
            let id = self.current_id(index);
            tracing::debug!(pool = %self.target.name, slot = index, "Reusing saved session");
            metrics::record_pool_acquire(&self.target.name, "reused");
            self.update_gauges();
            return Ok(Admission::Bound(Checkout {
                id,
                session,
                fresh: false,
            }));
        }

        if let Some(index) = self.free.pop() {
            let checkout = self.open(index)?;
            metrics::record_pool_acquire(&self.target.name, "connecting");
            self.update_gauges();
            return Ok(Admission::Connecting(checkout));
        }

        self.queue.prune();
        let policy = &self.target.policy;
        if policy.queues() && self.queue.len() < policy.queue_depth {
            let deadline = Instant::now() + policy.queue_timeout;
            let (id, rx) = self.queue.push(deadline);
            tracing::debug!(pool = %self.target.name, ticket = id, queued = self.queue.len(), "Request deferred");
            metrics::record_pool_acquire(&self.target.name, "deferred");
            self.update_gauges();
            return Ok(Admission::Deferred(Ticket { id, rx, deadline }));
        }

        metrics::record_pool_acquire(&self.target.name, "rejected");
        Err(self.exhausted())
    }

    /// Take a session back from its request.
    ///
    /// Returns the watcher registration when the session was saved.
    pub fn release(&mut self, checkout: Checkout, outcome: ReleaseOutcome) -> Result<Option<SavedWatch>, GatewayError> {
        let Checkout { id, mut session, .. } = checkout;
        if !self.is_active(id) {
            tracing::error!(pool = %self.target.name, slot = id.index, "Release of a session the pool does not own");
            return Err(self.exhausted());
        }
        let index = id.index;

        let added = session.listens_mut().merge(outcome.listens);
        for registration in &added {
            session
                .stale_listens_mut()
                .retain(|stale| stale.channel() != registration.channel());
        }

        if let Some(reason) = self.discard_reason(&session, outcome.reusable) {
            self.destroy(index, session, reason);
            self.grant_freed();
            return Ok(None);
        }

        while let Some(waiter) = self.queue.pop() {
            let id = self.bump(index);
            let ticket = waiter.ticket;
            match offer(waiter, Checkout { id, session, fresh: false }) {
                None => {
                    tracing::debug!(pool = %self.target.name, ticket, "Released session handed to queued request");
                    self.update_gauges();
                    return Ok(None);
                }
                Some(returned) => session = returned.session,
            }
        }

        if !self.target.policy.saves_sessions() {
            self.destroy(index, session, "not_saved");
            return Ok(None);
        }

        let mut inherited = Vec::new();
        if self.saved.len() >= self.target.policy.max_saved {
            if let Some(victim) = self.saved.pop_front() {
                inherited = self.evict_into(victim, &mut session);
            }
        }

        let mut interest = Interest::Read;
        if !inherited.is_empty() {
            match drain::subscribe(&mut session, &inherited) {
                Ok(next) => interest = next,
                Err(e) => {
                    tracing::warn!(pool = %self.target.name, error = %e, "Failed to move subscriptions, dropping session");
                    self.destroy(index, session, "subscribe_failed");
                    return Ok(None);
                }
            }
        }
        Ok(Some(self.save(index, session, interest)))
    }

    /// Drain an idle-saved session on readiness.
    pub fn relay(&mut self, id: SessionId) -> RelayStatus {
        if !self.is_saved(id) {
            return RelayStatus::Gone;
        }
        let sink = self.sink.clone();
        let result = match self.slots.get_mut(id.index) {
            Some(SlotEntry {
                slot: Slot::Saved(saved),
                ..
            }) => drain::drain(&mut saved.session, sink.as_deref()),
            _ => return RelayStatus::Gone,
        };
        match result {
            Ok(interest) => RelayStatus::Continue(interest),
            Err(e) => {
                tracing::debug!(pool = %self.target.name, slot = id.index, error = %e, "Idle session failed");
                self.discard_saved(id, "relay_error");
                RelayStatus::Closed
            }
        }
    }

    /// Keepalive expired for a saved session.
    pub fn expire(&mut self, id: SessionId) -> bool {
        let expired = self.discard_saved(id, "keepalive");
        if expired {
            tracing::debug!(pool = %self.target.name, slot = id.index, "Saved session keepalive expired");
        }
        expired
    }

    /// Destroy a saved session if `id` still names it.
    pub fn discard_saved(&mut self, id: SessionId, reason: &'static str) -> bool {
        if !self.is_saved(id) {
            return false;
        }
        self.saved.retain(|&index| index != id.index);
        if let Some(session) = self.take_saved(id.index) {
            self.destroy(id.index, session, reason);
            self.grant_freed();
        }
        true
    }

    /// Withdraw a deferred request. False when it was already granted.
    pub fn cancel_waiter(&mut self, ticket: u64) -> bool {
        let cancelled = self.queue.cancel(ticket);
        if cancelled {
            self.update_gauges();
        }
        cancelled
    }

    /// Stop saving sessions and fail every queued request.
    pub fn shutdown(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        let error = self.exhausted();
        let waiters: Vec<Waiter> = self.queue.drain().collect();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        while let Some(index) = self.saved.pop_front() {
            if let Some(session) = self.take_saved(index) {
                self.destroy(index, session, "terminating");
            }
        }
        tracing::info!(pool = %self.target.name, active = self.stats().active, "Session pool terminating");
    }

    fn open(&mut self, index: usize) -> Result<Checkout, GatewayError> {
        match self.connector.connect(self.target.addr, &self.target.params) {
            Ok(conn) => {
                let id = self.bump(index);
                self.slots[index].slot = Slot::Active;
                tracing::debug!(pool = %self.target.name, slot = index, "Opening backend session");
                Ok(Checkout {
                    id,
                    session: BackendSession::new(conn, self.target.addr),
                    fresh: true,
                })
            }
            Err(e) => {
                self.free.push(index);
                Err(GatewayError::ConnectFailed {
                    target: self.target.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Serve queued requests while free slots remain.
    fn grant_freed(&mut self) {
        while !self.free.is_empty() {
            let Some(waiter) = self.queue.pop() else {
                break;
            };
            let Some(index) = self.free.pop() else {
                break;
            };
            match self.open(index) {
                Ok(checkout) => {
                    if let Some(returned) = offer(waiter, checkout) {
                        self.destroy(returned.id.index, returned.session, "abandoned");
                    }
                }
                Err(e) => {
                    let _ = waiter.tx.send(Err(e));
                }
            }
        }
        self.update_gauges();
    }

    fn discard_reason(&self, session: &BackendSession, reusable: bool) -> Option<&'static str> {
        if !reusable {
            Some("failed")
        } else if session.state() != SessionState::Idle {
            Some("unfinished")
        } else if session.conn().status() != ConnStatus::Ok {
            Some("closed")
        } else if self.terminating {
            Some("terminating")
        } else if self.target.policy.rotation_due(session.requests()) {
            Some("max_requests")
        } else if session.conn().transaction_status() != TransactionStatus::Idle {
            Some("in_transaction")
        } else {
            None
        }
    }

    /// Evict the least recently saved session, moving its registrations to `heir`.
    fn evict_into(&mut self, victim: usize, heir: &mut BackendSession) -> Vec<ListenRegistration> {
        let Some(mut evicted) = self.take_saved(victim) else {
            return Vec::new();
        };
        let moved = heir.listens_mut().merge(evicted.listens_mut().take());
        tracing::debug!(
            pool = %self.target.name,
            slot = victim,
            channels = moved.len(),
            "Evicting least recently saved session"
        );
        self.destroy(victim, evicted, "evicted");
        moved
    }

    fn save(&mut self, index: usize, session: BackendSession, interest: Interest) -> SavedWatch {
        let id = self.bump(index);
        let readiness = session.conn().readiness();
        let (stop_tx, stop_rx) = oneshot::channel();
        let wake = Arc::new(Notify::new());
        self.slots[index].slot = Slot::Saved(SavedSession {
            session,
            _stop: stop_tx,
            wake: wake.clone(),
        });
        self.saved.push_back(index);
        tracing::debug!(pool = %self.target.name, slot = index, saved = self.saved.len(), "Session saved");
        self.update_gauges();
        SavedWatch {
            id,
            readiness,
            stop: stop_rx,
            wake,
            deadline: Instant::now() + self.target.policy.keepalive,
            interest,
        }
    }

    fn take_saved(&mut self, index: usize) -> Option<BackendSession> {
        let entry = self.slots.get_mut(index)?;
        match std::mem::replace(&mut entry.slot, Slot::Active) {
            Slot::Saved(saved) => {
                entry.generation += 1;
                Some(saved.session)
            }
            other => {
                entry.slot = other;
                None
            }
        }
    }

    fn destroy(&mut self, index: usize, mut session: BackendSession, reason: &'static str) {
        let orphaned = session.listens_mut().take();
        session.set_state(SessionState::Closed);
        tracing::debug!(
            pool = %self.target.name,
            addr = %session.addr(),
            requests = session.requests(),
            reason,
            "Destroying backend session"
        );
        drop(session);

        if let Some(entry) = self.slots.get_mut(index) {
            if !matches!(entry.slot, Slot::Free) {
                entry.generation += 1;
                entry.slot = Slot::Free;
                self.free.push(index);
            }
        }
        metrics::record_session_destroyed(&self.target.name, reason);

        if !orphaned.is_empty() {
            self.adopt(orphaned);
        }
        self.update_gauges();
    }

    /// Give registrations of a dying session to the most recently saved one.
    ///
    /// A heir with a command in flight keeps them and subscribes once it is
    /// done; they are dropped only when no saved session can hold them.
    fn adopt(&mut self, registrations: Vec<ListenRegistration>) {
        if self.terminating {
            return;
        }
        for &index in self.saved.iter().rev() {
            let Some(SlotEntry {
                slot: Slot::Saved(saved),
                ..
            }) = self.slots.get_mut(index)
            else {
                continue;
            };
            let added = saved.session.listens_mut().merge(registrations.iter().cloned());
            match drain::subscribe(&mut saved.session, &added) {
                Ok(_) => {
                    saved.wake.notify_one();
                    tracing::debug!(pool = %self.target.name, slot = index, channels = added.len(), "Subscriptions adopted");
                    return;
                }
                Err(e) => {
                    tracing::debug!(slot = index, error = %e, "Saved session cannot adopt subscriptions");
                    for registration in &added {
                        saved.session.drop_listen(registration.channel());
                    }
                }
            }
        }
        tracing::warn!(
            pool = %self.target.name,
            channels = registrations.len(),
            "No saved session left to keep subscriptions"
        );
    }

    fn is_active(&self, id: SessionId) -> bool {
        matches!(
            self.slots.get(id.index),
            Some(entry) if entry.generation == id.generation && matches!(entry.slot, Slot::Active)
        )
    }

    fn is_saved(&self, id: SessionId) -> bool {
        matches!(
            self.slots.get(id.index),
            Some(entry) if entry.generation == id.generation && matches!(entry.slot, Slot::Saved(_))
        )
    }

    fn bump(&mut self, index: usize) -> SessionId {
        let entry = &mut self.slots[index];
        entry.generation += 1;
        SessionId {
            index,
            generation: entry.generation,
        }
    }

    fn current_id(&self, index: usize) -> SessionId {
        SessionId {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn exhausted(&self) -> GatewayError {
        GatewayError::PoolExhausted {
            target: self.target.name.clone(),
        }
    }

    fn update_gauges(&self) {
        metrics::update_pool_gauges(&self.target.name, &self.stats());
    }
}

/// Grant a checkout to a waiter; hands it back if the waiter is gone.
fn offer(waiter: Waiter, checkout: Checkout) -> Option<Checkout> {
    match waiter.tx.send(Ok(checkout)) {
        Ok(()) => None,
        Err(Ok(checkout)) => Some(checkout),
        Err(Err(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::conninfo::ConnParams;
    use crate::config::schema::OverflowPolicy;
    use crate::protocol::context::RequestContext;
    use crate::protocol::machine::{Event, ProtocolMachine, Step};
    use crate::protocol::statement::CompiledStatement;
    use crate::protocol::types;
    use crate::upstream::target::PoolPolicy;
    use crate::wire::mock::{rows_result, MockCommand, MockConnector, MockEvent, MockHandle, MockWire};

    fn policy(max_sessions: usize, max_saved: usize) -> PoolPolicy {
        PoolPolicy {
            max_sessions,
            max_saved,
            overflow: OverflowPolicy::Reject,
            queue_depth: 0,
            queue_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(60),
            ..PoolPolicy::default()
        }
    }

    fn queueing(max_sessions: usize, queue_depth: usize) -> PoolPolicy {
        PoolPolicy {
            overflow: OverflowPolicy::Queue,
            queue_depth,
            ..policy(max_sessions, max_sessions)
        }
    }

    fn pool(policy: PoolPolicy) -> (SessionPool, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let target = Arc::new(BackendTarget::new(
            "main",
            "127.0.0.1:5432".parse().unwrap(),
            ConnParams::default(),
            policy,
        ));
        (SessionPool::new(target, connector.clone(), None), connector)
    }

    fn checkout(admission: Admission) -> Checkout {
        match admission {
            Admission::Bound(c) | Admission::Connecting(c) => c,
            Admission::Deferred(_) => panic!("unexpected deferral"),
        }
    }

    fn run(pool: &SessionPool, checkout: &mut Checkout, sql: &str) -> Result<RequestContext, GatewayError> {
        let mut ctx = RequestContext::new(CompiledStatement::simple(sql));
        let mut machine = ProtocolMachine::new(&pool.target().policy);
        let mut event = Event::Start;
        loop {
            match machine.advance(checkout.session_mut(), &mut ctx, event)? {
                Step::Done => return Ok(ctx),
                Step::Wait(Interest::Read) => event = Event::Readable,
                Step::Wait(Interest::Write) => event = Event::Writable,
            }
        }
    }

    fn finish(pool: &mut SessionPool, mut checkout: Checkout, sql: &str) -> Option<SavedWatch> {
        let mut ctx = run(pool, &mut checkout, sql).unwrap();
        pool.release(checkout, ReleaseOutcome::clean(ctx.take_listens())).unwrap()
    }

    fn assert_capacity(pool: &SessionPool) {
        let stats = pool.stats();
        assert!(stats.active + stats.saved <= pool.target().policy.max_sessions);
        assert_eq!(stats.active + stats.saved + stats.free, pool.target().policy.max_sessions);
    }

    #[tokio::test]
    async fn test_reuse_without_reconnect() {
        let (mut pool, connector) = pool(policy(1, 1));

        let a = pool.acquire().unwrap();
        assert!(matches!(a, Admission::Connecting(_)));
        assert!(finish(&mut pool, checkout(a), "SELECT 1").is_some());
        assert_eq!(pool.stats().saved, 1);

        let b = pool.acquire().unwrap();
        assert!(matches!(b, Admission::Bound(_)));
        assert_eq!(connector.attempts(), 1);

        let mut b = checkout(b);
        assert!(!b.is_fresh());
        run(&pool, &mut b, "SELECT 2").unwrap();
        assert_eq!(b.session().requests(), 2);
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let (mut pool, connector) = pool(policy(1, 1));
        let _a = checkout(pool.acquire().unwrap());
        let before = pool.stats();

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));
        assert_eq!(pool.stats(), before);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_queue_depth_zero_rejects() {
        let (mut pool, _) = pool(queueing(1, 0));
        let _a = checkout(pool.acquire().unwrap());
        assert!(matches!(pool.acquire(), Err(GatewayError::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn test_queued_request_gets_released_session() {
        let (mut pool, connector) = pool(queueing(1, 1));
        let a = checkout(pool.acquire().unwrap());

        let Admission::Deferred(mut ticket) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };
        assert_eq!(pool.stats().queued, 1);
        // Queue full as well.
        assert!(matches!(pool.acquire(), Err(GatewayError::PoolExhausted { .. })));

        assert!(finish(&mut pool, a, "SELECT 1").is_none());
        let mut granted = ticket.rx.try_recv().unwrap().unwrap();
        assert!(!granted.is_fresh());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(pool.stats().queued, 0);

        run(&pool, &mut granted, "SELECT 2").unwrap();
        assert!(pool.release(granted, ReleaseOutcome::clean(Vec::new())).unwrap().is_some());
        assert_capacity(&pool);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (mut pool, _) = pool(queueing(1, 2));
        let a = checkout(pool.acquire().unwrap());
        let Admission::Deferred(mut first) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };
        let Admission::Deferred(mut second) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };

        finish(&mut pool, a, "SELECT 1");
        assert!(second.rx.try_recv().is_err());
        let b = first.rx.try_recv().unwrap().unwrap();

        finish(&mut pool, b, "SELECT 1");
        assert!(second.rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_freed_slot_goes_to_waiter_first() {
        let (mut pool, connector) = pool(queueing(1, 1));
        let mut a = checkout(pool.acquire().unwrap());
        let Admission::Deferred(mut ticket) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };

        run(&pool, &mut a, "SELECT 1").unwrap();
        pool.release(a, ReleaseOutcome::failed()).unwrap();

        let granted = ticket.rx.try_recv().unwrap().unwrap();
        assert!(granted.is_fresh());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let (mut pool, _) = pool(queueing(1, 2));
        let a = checkout(pool.acquire().unwrap());
        let Admission::Deferred(first) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };
        let Admission::Deferred(mut second) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };

        assert!(pool.cancel_waiter(first.id));
        finish(&mut pool, a, "SELECT 1");
        assert!(second.rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_listen_migrates_on_eviction() {
        let (mut pool, connector) = pool(policy(2, 1));
        let s1 = checkout(pool.acquire().unwrap());
        let s2 = checkout(pool.acquire().unwrap());

        finish(&mut pool, s1, "LISTEN x");
        assert_eq!(pool.stats().saved, 1);

        // Saving s2 evicts s1, whose registration must follow.
        finish(&mut pool, s2, "SELECT 1");
        let stats = pool.stats();
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(
            connector.handle(1).sent().last(),
            Some(&MockCommand::Simple("LISTEN \"x\"".into()))
        );

        let heir = checkout(pool.acquire().unwrap());
        assert!(heir.session().listens().contains("x"));
        assert_eq!(connector.attempts(), 2);
    }

    /// Three sessions; s2 is left saved with the LISTEN it inherited from s1
    /// still in flight, then s3 (holding `y`) expires.
    fn busy_heir() -> (SessionPool, Arc<MockConnector>, SavedWatch) {
        let (mut pool, connector) = pool(policy(3, 2));
        let s1 = checkout(pool.acquire().unwrap());
        let s2 = checkout(pool.acquire().unwrap());
        let s3 = checkout(pool.acquire().unwrap());

        finish(&mut pool, s1, "LISTEN x");
        let s3_watch = finish(&mut pool, s3, "LISTEN y").unwrap();
        let heir_watch = finish(&mut pool, s2, "SELECT 1").unwrap();
        assert_eq!(
            connector.handle(1).sent().last(),
            Some(&MockCommand::Simple("LISTEN \"x\"".into()))
        );

        assert!(pool.expire(s3_watch.id));
        (pool, connector, heir_watch)
    }

    #[tokio::test]
    async fn test_busy_heir_subscribes_after_outstanding_command() {
        let (mut pool, connector, heir) = busy_heir();
        assert_eq!(pool.stats().saved, 1);
        let listen_y = MockCommand::Simple("LISTEN \"y\"".into());
        assert!(!connector.handle(1).sent().contains(&listen_y));
        tokio::time::timeout(Duration::from_millis(100), heir.wake.notified())
            .await
            .expect("watcher was not asked for a relay pass");

        assert_eq!(pool.relay(heir.id), RelayStatus::Continue(Interest::Read));
        assert_eq!(connector.handle(1).sent().last(), Some(&listen_y));

        let reused = checkout(pool.acquire().unwrap());
        assert!(reused.session().listens().contains("x"));
        assert!(reused.session().listens().contains("y"));
    }

    #[tokio::test]
    async fn test_reused_busy_heir_subscribes_before_request() {
        let (mut pool, connector, _) = busy_heir();

        let mut reused = checkout(pool.acquire().unwrap());
        assert!(reused.session().listens().contains("y"));
        run(&pool, &mut reused, "SELECT 2").unwrap();

        let sent = connector.handle(1).sent();
        let position = |sql: &str| sent.iter().position(|c| *c == MockCommand::Simple(sql.into())).unwrap();
        let (x, y) = (position("LISTEN \"x\""), position("LISTEN \"y\""));
        assert_eq!(y, x + 1);
        assert!(y < sent.len() - 1, "request ran before the subscription");
    }

    #[tokio::test]
    async fn test_registrations_are_not_resubscribed() {
        let (mut pool, connector) = pool(policy(1, 1));
        let a = checkout(pool.acquire().unwrap());
        finish(&mut pool, a, "LISTEN x");

        let b = checkout(pool.acquire().unwrap());
        finish(&mut pool, b, "LISTEN x");

        let reused = checkout(pool.acquire().unwrap());
        assert_eq!(reused.session().listens().len(), 1);
        let listens = connector
            .handle(0)
            .sent()
            .into_iter()
            .filter(|c| matches!(c, MockCommand::Simple(sql) if sql.contains("LISTEN")))
            .count();
        assert_eq!(listens, 2);
    }

    #[tokio::test]
    async fn test_extra_result_destroys_session() {
        let (mut pool, connector) = pool(PoolPolicy {
            prepare: false,
            ..policy(1, 1)
        });
        let mut a = checkout(pool.acquire().unwrap());
        connector.handle(0).push_reply(vec![
            MockEvent::Result(rows_result("a", types::INT4, &[Some("1")])),
            MockEvent::Result(rows_result("b", types::INT4, &[Some("2")])),
            MockEvent::Ready,
        ]);

        let err = run(&pool, &mut a, "SELECT 1; SELECT 2").unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedExtraResult));
        assert!(pool.release(a, ReleaseOutcome::failed()).unwrap().is_none());

        let stats = pool.stats();
        assert_eq!((stats.saved, stats.free), (0, 1));
        assert!(matches!(pool.acquire().unwrap(), Admission::Connecting(_)));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_backend_error_keeps_session() {
        let (mut pool, connector) = pool(PoolPolicy {
            prepare: false,
            ..policy(1, 1)
        });
        let mut a = checkout(pool.acquire().unwrap());
        connector.handle(0).push_reply(vec![
            MockEvent::Result(crate::wire::mock::error_result("division by zero")),
            MockEvent::Ready,
        ]);

        let ctx = run(&pool, &mut a, "SELECT 1/0").unwrap();
        assert!(ctx.backend_error().is_some());
        assert!(pool.release(a, ReleaseOutcome::clean(Vec::new())).unwrap().is_some());
        assert!(matches!(pool.acquire().unwrap(), Admission::Bound(_)));
    }

    #[tokio::test]
    async fn test_release_twice_is_rejected() {
        let (mut pool, _) = pool(policy(1, 1));
        let a = checkout(pool.acquire().unwrap());
        let stale_id = a.id();
        finish(&mut pool, a, "SELECT 1");
        let before = pool.stats();

        let forged = Checkout {
            id: stale_id,
            session: BackendSession::new(
                Box::new(MockWire::new(MockHandle::default())),
                "127.0.0.1:5432".parse().unwrap(),
            ),
            fresh: false,
        };
        let err = pool.release(forged, ReleaseOutcome::clean(Vec::new())).err();
        assert!(matches!(err, Some(GatewayError::PoolExhausted { .. })));
        assert_eq!(pool.stats(), before);
    }

    #[tokio::test]
    async fn test_rotation_after_max_requests() {
        let (mut pool, connector) = pool(PoolPolicy {
            max_requests: 1,
            ..policy(1, 1)
        });
        let a = checkout(pool.acquire().unwrap());
        assert!(finish(&mut pool, a, "SELECT 1").is_none());
        assert!(matches!(pool.acquire().unwrap(), Admission::Connecting(_)));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let (mut pool, connector) = pool(policy(2, 2));
        connector.refuse.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(matches!(pool.acquire(), Err(GatewayError::ConnectFailed { .. })));
        assert_eq!(pool.stats().free, 2);
    }

    #[tokio::test]
    async fn test_expire_and_relay_on_stale_id() {
        let (mut pool, _) = pool(policy(1, 1));
        let a = checkout(pool.acquire().unwrap());
        let watch = finish(&mut pool, a, "SELECT 1").unwrap();

        assert_eq!(pool.relay(watch.id), RelayStatus::Continue(Interest::Read));
        assert!(pool.expire(watch.id));
        assert_eq!(pool.relay(watch.id), RelayStatus::Gone);
        assert!(!pool.expire(watch.id));
        assert_eq!(pool.stats().free, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_drops_saved() {
        let (mut pool, _) = pool(queueing(2, 1));
        let a = checkout(pool.acquire().unwrap());
        finish(&mut pool, a, "SELECT 1");
        let b = checkout(pool.acquire().unwrap());
        let c = checkout(pool.acquire().unwrap());
        let Admission::Deferred(mut ticket) = pool.acquire().unwrap() else {
            panic!("expected deferral");
        };

        pool.shutdown();
        assert!(matches!(ticket.rx.try_recv(), Ok(Err(GatewayError::PoolExhausted { .. }))));
        assert!(matches!(pool.acquire(), Err(GatewayError::PoolExhausted { .. })));

        assert!(finish(&mut pool, b, "SELECT 1").is_none());
        assert!(finish(&mut pool, c, "SELECT 1").is_none());
        assert_eq!(pool.stats().free, 2);
    }

    #[tokio::test]
    async fn test_capacity_invariant_under_churn() {
        let (mut pool, _) = pool(queueing(3, 2));
        let mut held: Vec<Checkout> = Vec::new();
        let mut tickets = Vec::new();

        for round in 0..40 {
            if round % 3 == 2 && !held.is_empty() {
                let c = held.remove(0);
                if round % 2 == 0 {
                    finish(&mut pool, c, "SELECT 1");
                } else {
                    pool.release(c, ReleaseOutcome::failed()).unwrap();
                }
            } else {
                match pool.acquire() {
                    Ok(Admission::Bound(c)) | Ok(Admission::Connecting(c)) => held.push(c),
                    Ok(Admission::Deferred(t)) => tickets.push(t),
                    Err(_) => {}
                }
            }
            for ticket in tickets.iter_mut() {
                if let Ok(Ok(c)) = ticket.rx.try_recv() {
                    held.push(c);
                }
            }
            assert_capacity(&pool);
            assert!(held.len() <= 3);
        }
    }
}
