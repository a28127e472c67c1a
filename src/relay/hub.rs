//! In-process channel hub backing the SSE subscription endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::relay::sink::{PubSubSink, PublishOutcome};

/// Broadcast channels keyed by notification channel name.
#[derive(Debug, Clone)]
pub struct ChannelHub {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscribers(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop every channel, ending all subscriber streams.
    pub fn close(&self) {
        self.channels.clear();
    }
}

impl PubSubSink for ChannelHub {
    fn publish(&self, channel: &str, payload: &str) -> PublishOutcome {
        let Some(tx) = self.channels.get(channel) else {
            return PublishOutcome::NoSuchChannel;
        };
        match tx.send(payload.to_string()) {
            Ok(_) => PublishOutcome::Delivered,
            Err(_) => PublishOutcome::NoSuchChannel,
        }
    }

    fn remove_channel(&self, channel: &str) {
        // Keep channels someone subscribed to again in the meantime.
        self.channels.remove_if(channel, |_, tx| tx.receiver_count() == 0);
    }
}
