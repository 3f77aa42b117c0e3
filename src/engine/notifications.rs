use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::RideStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    /// A new request entered this driver's pool.
    Offered,
    Accepted,
    Arrived,
    Started,
    Completed,
    Cancelled,
}

impl Edge {
    pub fn entering(status: RideStatus) -> Option<Self> {
        match status {
            RideStatus::Searching => None,
            RideStatus::Accepted => Some(Self::Accepted),
            RideStatus::Arrived => Some(Self::Arrived),
            RideStatus::InProgress => Some(Self::Started),
            RideStatus::Completed => Some(Self::Completed),
            RideStatus::Cancelled => Some(Self::Cancelled),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub ride_id: Uuid,
    pub edge: Edge,
}

/// Remembers which `(ride, edge)` pairs were already announced, so a feed
/// replaying the same change does not notify twice.
#[derive(Debug, Default)]
pub struct NotificationLog {
    fired: HashSet<(Uuid, Edge)>,
    outbox: Vec<Notification>,
}

impl NotificationLog {
    pub fn fire(&mut self, ride_id: Uuid, edge: Edge) -> bool {
        if !self.fired.insert((ride_id, edge)) {
            return false;
        }

        tracing::debug!(%ride_id, ?edge, "notification queued");
        self.outbox.push(Notification { ride_id, edge });
        true
    }

    /// Drops every marker of a ride that is no longer tracked.
    pub fn forget(&mut self, ride_id: Uuid) {
        self.fired.retain(|(id, _)| *id != ride_id);
    }

    #[cfg(test)]
    pub fn has_fired(&self, ride_id: Uuid, edge: Edge) -> bool {
        self.fired.contains(&(ride_id, edge))
    }

    pub fn drain(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }
}

#[test]
fn each_edge_fires_once_per_ride() {
    let mut log = NotificationLog::default();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    assert!(log.fire(a, Edge::Accepted));
    assert!(!log.fire(a, Edge::Accepted));
    assert!(log.fire(a, Edge::Arrived));
    assert!(log.fire(b, Edge::Accepted));

    let drained = log.drain();
    assert_eq!(drained.len(), 3);
    assert!(log.drain().is_empty());
    assert!(log.has_fired(a, Edge::Accepted));

    log.forget(a);
    assert!(!log.has_fired(a, Edge::Arrived));
    assert!(log.has_fired(b, Edge::Accepted));
    assert!(log.fire(a, Edge::Accepted));
}
