//! Draining idle-saved sessions and managing their backend subscriptions.

use crate::observability::metrics;
use crate::relay::sink::{PubSubSink, PublishOutcome};
use crate::upstream::listen::{self, ListenRegistration};
use crate::upstream::session::BackendSession;
use crate::wire::{Interest, WireError};

/// One relay pass over an idle-saved session.
///
/// Consumes everything the backend sent, forwards notifications to the sink,
/// unsubscribes channels the sink no longer knows, then sends subscriptions
/// that were waiting for the session to go idle. Backend errors are
/// logged only: no request owns this session. Returns the readiness the
/// session needs next.
pub fn drain(session: &mut BackendSession, sink: Option<&dyn PubSubSink>) -> Result<Interest, WireError> {
    let addr = session.addr();
    let conn = session.conn_mut();
    if !conn.flush()? {
        return Ok(Interest::Write);
    }
    conn.consume_input()?;

    while !conn.is_busy() {
        match conn.get_result() {
            Some(result) if result.is_fatal() => {
                tracing::warn!(addr = %addr, error = %result.error_message(), "Backend error on idle session");
            }
            Some(_) => {}
            None => break,
        }
    }

    let mut unknown = Vec::new();
    while let Some(notification) = conn.notifies() {
        let outcome = match sink {
            Some(sink) => sink.publish(&notification.channel, &notification.payload),
            None => PublishOutcome::NoSuchChannel,
        };
        metrics::record_notification(outcome.as_str());
        match outcome {
            PublishOutcome::Delivered => {
                tracing::trace!(addr = %addr, channel = %notification.channel, "Notification relayed");
            }
            PublishOutcome::NoSuchChannel => unknown.push(notification.channel),
            PublishOutcome::Error(e) => {
                tracing::warn!(addr = %addr, channel = %notification.channel, error = %e, "Failed to publish notification");
            }
        }
    }

    for channel in unknown {
        session.pending_listens_mut().retain(|r| r.channel() != channel);
        if let Some(registration) = session.listens_mut().remove(&channel) {
            tracing::debug!(addr = %addr, channel = %channel, "Channel has no subscribers, unlistening");
            session.stale_listens_mut().push(registration);
        }
    }

    send_unlistens(session, sink)?;
    send_listens(session)?;

    Ok(if session.conn_mut().flush()? {
        Interest::Read
    } else {
        Interest::Write
    })
}

/// Send one UNLISTEN batch for every registration slated for removal.
///
/// Deferred while a command is outstanding on the session.
pub fn send_unlistens(session: &mut BackendSession, sink: Option<&dyn PubSubSink>) -> Result<(), WireError> {
    if session.stale_listens_mut().is_empty() {
        return Ok(());
    }
    let stale = std::mem::take(session.stale_listens_mut());
    let Some(batch) = listen::batch(stale.iter().map(ListenRegistration::unsubscribe_command)) else {
        return Ok(());
    };

    match session.conn_mut().send_query(&batch) {
        Ok(()) => {
            if let Some(sink) = sink {
                for registration in &stale {
                    sink.remove_channel(registration.channel());
                }
            }
            Ok(())
        }
        Err(WireError::Busy) => {
            *session.stale_listens_mut() = stale;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Send one LISTEN batch for every registration waiting on the session.
///
/// Deferred while a command is outstanding. Returns whether a batch went out.
pub fn send_listens(session: &mut BackendSession) -> Result<bool, WireError> {
    let pending = std::mem::take(session.pending_listens_mut());
    let Some(batch) = listen::batch(pending.iter().map(ListenRegistration::subscribe_command)) else {
        return Ok(false);
    };
    match session.conn_mut().send_query(&batch) {
        Ok(()) => Ok(true),
        Err(WireError::Busy) => {
            *session.pending_listens_mut() = pending;
            Ok(false)
        }
        Err(e) => {
            *session.pending_listens_mut() = pending;
            Err(e)
        }
    }
}

/// Subscribe `session` to `registrations`, now or after its outstanding command.
pub fn subscribe(session: &mut BackendSession, registrations: &[ListenRegistration]) -> Result<Interest, WireError> {
    if registrations.is_empty() {
        return Ok(Interest::Read);
    }
    session
        .stale_listens_mut()
        .retain(|stale| registrations.iter().all(|r| r.channel() != stale.channel()));
    session.pending_listens_mut().extend(registrations.iter().cloned());
    send_listens(session)?;
    let conn = session.conn_mut();
    Ok(if conn.flush()? { Interest::Read } else { Interest::Write })
}
