//! Publish/subscribe sink interface.

/// Result of handing one notification to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Nobody is subscribed to the channel any more.
    NoSuchChannel,
    Error(String),
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Delivered => "delivered",
            PublishOutcome::NoSuchChannel => "no_such_channel",
            PublishOutcome::Error(_) => "error",
        }
    }
}

/// Destination for notifications relayed from idle-saved sessions.
pub trait PubSubSink: Send + Sync {
    fn publish(&self, channel: &str, payload: &str) -> PublishOutcome;

    /// The backend stopped listening on `channel`.
    fn remove_channel(&self, channel: &str);
}
