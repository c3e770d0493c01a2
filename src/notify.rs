//! Notification Bus (§4.F, component G): in-process pub/sub for state-change
//! events. Publishing never fails the caller -- a subscriber that can't keep
//! up or has gone away is logged and dropped, never propagated (§4.F:
//! "subscriber failures are swallowed").

use std::sync::Arc;
use tokio::sync::broadcast;

/// Bound on the broadcast channel; a slow subscriber falls behind and starts
/// missing events rather than backpressuring the publisher.
const CHANNEL_CAPACITY: usize = 1024;

/// A command's state transition, mirrored to subscribers (§6
/// `notifications/commandStatus`).
#[derive(Debug, Clone)]
pub struct CommandStatusEvent {
    pub session_id: String,
    pub command_id: String,
    pub state: String,
}

/// A session lifecycle transition (§6 `notifications/sessionEvent`).
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Created,
    Closed,
    Expired,
    Disposed,
    /// The debugger subprocess died outside of a caller-initiated close
    /// (§8 "process death" scenario); the manager reacts by closing the
    /// session the same way it would to an explicit close.
    ProcessDied,
}

/// The event envelope subscribers actually receive.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    CommandStatus(CommandStatusEvent),
    Session(SessionEvent),
}

/// Cloneable handle around a broadcast channel. Every publish is fire-and-
/// forget from the caller's perspective.
pub struct NotificationBus {
    sender: broadcast::Sender<NotificationEvent>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the bus; each subscriber gets its own lagging receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    pub async fn publish_command(&self, event: CommandStatusEvent) {
        self.publish(NotificationEvent::CommandStatus(event)).await;
    }

    pub async fn publish_session(&self, event: SessionEvent) {
        self.publish(NotificationEvent::Session(event)).await;
    }

    async fn publish(&self, event: NotificationEvent) {
        // `send` only fails when there are no subscribers, which is a
        // perfectly normal state (e.g. no client has attached yet) and not
        // worth logging as an error.
        if let Err(broadcast::error::SendError(_)) = self.sender.send(event) {
            tracing::trace!("notification published with no subscribers");
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = NotificationBus::new();
        bus.publish_command(CommandStatusEvent {
            session_id: "sess-000001-deadbeef".into(),
            command_id: "cmd-sess-000001-deadbeef-0000".into(),
            state: "queued".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        bus.publish_session(SessionEvent {
            session_id: "sess-000001-deadbeef".into(),
            kind: SessionEventKind::Created,
        })
        .await;
        let event = rx.recv().await.unwrap();
        match event {
            NotificationEvent::Session(e) => assert_eq!(e.kind, SessionEventKind::Created),
            NotificationEvent::CommandStatus(_) => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_lagged_not_closed() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish_command(CommandStatusEvent {
                session_id: "sess-000001-deadbeef".into(),
                command_id: format!("cmd-sess-000001-deadbeef-{i:04}"),
                state: "queued".into(),
            })
            .await;
        }
        let err = loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
    }
}
