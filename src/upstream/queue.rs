//! Overflow queue of deferred acquisitions.
//!
//! Waiters are granted strictly in arrival order. Expiry is handled by the
//! waiting side: it removes itself with [`OverflowQueue::cancel`] when its
//! deadline passes.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::upstream::pool::Checkout;

/// What a deferred acquisition eventually receives.
pub type Grant = Result<Checkout, GatewayError>;

#[derive(Debug)]
pub struct Waiter {
    pub ticket: u64,
    pub deadline: Instant,
    pub tx: oneshot::Sender<Grant>,
}

impl Waiter {
    /// Receiver went away (request aborted or timed out).
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct OverflowQueue {
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

impl OverflowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Enqueue a waiter and return its ticket and receiving end.
    pub fn push(&mut self, deadline: Instant) -> (u64, oneshot::Receiver<Grant>) {
        let (tx, rx) = oneshot::channel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.waiters.push_back(Waiter { ticket, deadline, tx });
        (ticket, rx)
    }

    /// Head of the queue, skipping waiters that are gone or past their deadline.
    pub fn pop(&mut self) -> Option<Waiter> {
        let now = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_abandoned() || waiter.deadline <= now {
                continue;
            }
            return Some(waiter);
        }
        None
    }

    /// Drop waiters that are gone or expired so they stop counting against the depth.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.waiters.retain(|w| !w.is_abandoned() && w.deadline > now);
    }

    /// Remove a waiter by ticket. False when it was already granted.
    pub fn cancel(&mut self, ticket: u64) -> bool {
        match self.waiters.iter().position(|w| w.ticket == ticket) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Waiter> + '_ {
        self.waiters.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let mut queue = OverflowQueue::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (a, _rx_a) = queue.push(deadline);
        let (b, _rx_b) = queue.push(deadline);

        assert_eq!(queue.pop().map(|w| w.ticket), Some(a));
        assert_eq!(queue.pop().map(|w| w.ticket), Some(b));
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_skips_abandoned_and_expired() {
        let mut queue = OverflowQueue::new();
        let (_, rx) = queue.push(Instant::now() + Duration::from_secs(5));
        drop(rx);
        let (_, _expired) = queue.push(Instant::now() - Duration::from_millis(1));
        let (live, _rx) = queue.push(Instant::now() + Duration::from_secs(5));

        assert_eq!(queue.pop().map(|w| w.ticket), Some(live));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel() {
        let mut queue = OverflowQueue::new();
        let (ticket, _rx) = queue.push(Instant::now() + Duration::from_secs(5));
        assert!(queue.cancel(ticket));
        assert!(!queue.cancel(ticket));
        assert_eq!(queue.len(), 0);
    }
}
