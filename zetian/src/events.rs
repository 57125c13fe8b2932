//! Observer-style server events.
//!
//! Events fan out over a broadcast channel and are consumed on a
//! dedicated dispatch task, so a slow subscriber can never stall a
//! session; laggards skip messages instead.

use zetian_common::{EnvelopeId, FilterAction};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    SessionStarted {
        session_id: String,
        remote_ip: std::net::IpAddr,
    },
    SessionEnded {
        session_id: String,
        messages: u32,
    },
    MessageReceived {
        envelope_id: EnvelopeId,
        action: FilterAction,
        score: f64,
    },
    MessageGreylisted {
        retry_after_secs: u64,
    },
    AuthSucceeded {
        identity: String,
    },
    AuthFailed {
        identity: String,
    },
    ErrorOccurred {
        context: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<ServerEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(1024);
        Self { sender }
    }

    pub fn emit(&self, event: ServerEvent) {
        // No receivers is fine; events are advisory
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Spawn the log-everything subscriber.
    pub fn spawn_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => tracing::debug!(?event, "server event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(ServerEvent::AuthSucceeded {
            identity: "alice".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event,
            ServerEvent::AuthSucceeded { identity } if identity == "alice"
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(ServerEvent::ErrorOccurred {
            context: "nothing listens".to_string(),
        });
    }
}
