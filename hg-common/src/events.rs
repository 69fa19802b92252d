use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which protocol family a lease or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4 => write!(f, "v4"),
            Self::V6 => write!(f, "v6"),
        }
    }
}

/// What happened to the lease table.
///
/// `DbStore` asks the snapshot writer to persist; the other kinds describe
/// the mutation for external consumers (the DNS resolver, the admin API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Added,
    AddedStatic,
    RemovedStatic,
    RemovedAll,
    DbStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseEvent {
    pub family: Family,
    pub kind: LeaseEventKind,
}

/// Broadcast bus for lease-change notifications.
///
/// Senders must only publish after the store lock has been released, so a
/// subscriber may call back into the store without deadlocking.
pub struct EventBus {
    pub lease: broadcast::Sender<LeaseEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            lease: broadcast::channel(64).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.lease.subscribe()
    }

    /// Publish one event per kind. Send errors (no subscribers) are ignored.
    pub fn publish(&self, family: Family, kinds: &[LeaseEventKind]) {
        for kind in kinds {
            let _ = self.lease.send(LeaseEvent { family, kind: *kind });
        }
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
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(
            Family::V4,
            &[LeaseEventKind::AddedStatic, LeaseEventKind::DbStore],
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LeaseEvent { family: Family::V4, kind: LeaseEventKind::AddedStatic }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LeaseEvent { family: Family::V4, kind: LeaseEventKind::DbStore }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(Family::V6, &[LeaseEventKind::Added]);
    }
}
