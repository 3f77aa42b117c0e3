use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::notifications::Edge;
use super::Engine;
use crate::{
    api::{ChangeEvent, EventType},
    auth::Role,
    entities::RideRequest,
};

/// Authoritative state fetched after (re)subscribing.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// The caller's current non-terminal ride.
    pub active: Option<RideRequest>,
    /// Latest state of a ride the session was following when it lost the feed
    /// and which is no longer active. `Some(None)` means the row is gone.
    pub ended: Option<(Uuid, Option<RideRequest>)>,
    /// Every searching request, for driver sessions.
    pub pool: Vec<RideRequest>,
}

impl Engine {
    /// Applies one feed delivery. Rows are full snapshots; a snapshot replaces
    /// local state only when it is more recent than what is already known, so
    /// replays and reordering converge to the same projections.
    #[tracing::instrument(skip(self, event), fields(ride_id = %event.row.id, event_type = ?event.event_type, status = %event.row.status))]
    pub fn apply(&mut self, event: ChangeEvent, now: DateTime<Utc>) {
        if !self.is_relevant(&event.row) {
            return;
        }

        match event.event_type {
            EventType::Insert | EventType::Update => {
                self.absorb(event.row, now);
            }
            EventType::Delete => self.forget(event.row.id, now),
        }
    }

    /// Replaces local projections with authoritative state. Notification
    /// markers survive, so anything already announced stays quiet.
    #[tracing::instrument(skip_all, fields(pool = snapshot.pool.len(), active = snapshot.active.is_some()))]
    pub fn resync(&mut self, snapshot: Snapshot, now: DateTime<Utc>) {
        if let Some((id, ended)) = snapshot.ended {
            match ended {
                Some(row) => {
                    self.absorb(row, now);
                }
                None => self.forget(id, now),
            }
        }

        if let Some(row) = snapshot.active {
            self.absorb(row, now);
        }

        if self.user.is_driver() {
            self.pool.clear();

            for row in snapshot.pool {
                self.absorb(row.clone(), now);

                if let Some(known) = self.known.get(&row.id).filter(|r| r.is_searching()) {
                    self.pool.on_inserted(known);
                }
            }
        }
    }

    /// Id of a non-terminal ride on the pointer that the store no longer
    /// reports as the caller's active ride.
    pub fn stale_pointer(&self, active: Option<&RideRequest>) -> Option<Uuid> {
        let current = self.active.as_ref().filter(|ride| !ride.is_terminal())?;

        match active {
            Some(ride) if ride.id == current.id => None,
            _ => Some(current.id),
        }
    }

    fn is_relevant(&self, row: &RideRequest) -> bool {
        match self.user.role {
            Role::Rider => row.customer_id == self.user.id,
            // drivers need every row: pool entries leave through other
            // drivers' accepts, and knowing them keeps late inserts out
            Role::Driver | Role::System => true,
        }
    }

    fn is_own(&self, row: &RideRequest) -> bool {
        row.customer_id == self.user.id || row.is_assigned_to(self.user.id)
    }

    /// Records a snapshot if it is newer than the known one and updates pool,
    /// pointer and notifications accordingly. Returns whether it was newer.
    pub(super) fn absorb(&mut self, row: RideRequest, now: DateTime<Utc>) -> bool {
        if self.tombstones.contains_key(&row.id) {
            return false;
        }

        let previous = self.known.get(&row.id).cloned();

        if let Some(known) = &previous {
            if !row.supersedes(known) {
                return false;
            }
        }

        self.known.insert(row.id, row.clone());

        if row.is_terminal() {
            self.ended.entry(row.id).or_insert(now);
        }

        if self.user.is_driver() {
            if row.is_searching() {
                if self.pool.on_inserted(&row) {
                    self.notifications.fire(row.id, Edge::Offered);
                }
            } else {
                self.pool.on_updated(&row);
            }
        }

        if self.is_own(&row) && self.point_at(&row, previous.as_ref(), now) {
            let entered = previous.map(|p| p.status) != Some(row.status);

            if let Some(edge) = Edge::entering(row.status).filter(|_| entered) {
                self.notifications.fire(row.id, edge);
            }
        }

        true
    }

    fn point_at(
        &mut self,
        row: &RideRequest,
        previous: Option<&RideRequest>,
        now: DateTime<Utc>,
    ) -> bool {
        let replace = match &self.active {
            Some(current) if current.id == row.id => true,
            Some(current) => {
                !row.is_terminal() && (current.is_terminal() || row.created_at > current.created_at)
            }
            // a terminal row only lands on an empty pointer when its end was
            // not already shown (and cleared)
            None => !row.is_terminal() || previous.map_or(false, |p| !p.is_terminal()),
        };

        if !replace {
            return false;
        }

        if row.is_terminal() {
            self.terminal_since.get_or_insert(now);
        } else {
            self.terminal_since = None;
            self.offers.withdraw();
        }

        self.active = Some(row.clone());

        true
    }

    /// Drops rides that ended more than the retention period ago, unless the
    /// pointer still shows them. Their ids stay tombstoned for another period
    /// so replays cannot bring them back; after that the notification markers
    /// go as well.
    pub(super) fn sweep(&mut self, now: DateTime<Utc>) {
        let retention = self.config.retention;
        let pointer = self.active.as_ref().map(|ride| ride.id);

        let expired: Vec<Uuid> = self
            .ended
            .iter()
            .filter(|(id, at)| **at + retention <= now && Some(**id) != pointer)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.ended.remove(&id);
            self.known.remove(&id);
            self.tombstones.insert(id, now + retention);
        }

        let notifications = &mut self.notifications;
        self.tombstones.retain(|id, until| {
            if *until > now {
                return true;
            }
            notifications.forget(*id);
            false
        });
    }

    fn forget(&mut self, id: Uuid, now: DateTime<Utc>) {
        self.tombstones.insert(id, now + self.config.retention);
        self.known.remove(&id);
        self.ended.remove(&id);
        self.pool.remove(id);

        if self.active.as_ref().map(|ride| ride.id) == Some(id) {
            self.active = None;
            self.terminal_since = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::auth::User;
    use crate::engine::test_support::*;
    use crate::engine::{Notification, SessionConfig};
    use crate::entities::{Rating, RideStatus};

    fn edges(notifications: Vec<Notification>) -> Vec<Edge> {
        notifications.into_iter().map(|n| n.edge).collect()
    }

    #[test]
    fn rider_follows_own_ride_through_lifecycle() {
        let rider = User::rider(Uuid::new_v4());
        let driver = Uuid::new_v4();
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());

        engine.apply(insert(&ride), Utc::now());
        for status in [
            RideStatus::Accepted,
            RideStatus::Arrived,
            RideStatus::InProgress,
            RideStatus::Completed,
        ] {
            engine.apply(update(&with_status(&ride, status, Some(driver))), Utc::now());
            assert_eq!(engine.active_ride().map(|r| r.status), Some(status));
        }

        assert_eq!(
            edges(engine.drain_notifications()),
            vec![Edge::Accepted, Edge::Arrived, Edge::Started, Edge::Completed]
        );
    }

    #[test]
    fn riders_ignore_other_riders() {
        let mut engine = engine(User::rider(Uuid::new_v4()));
        let ride = searching(Uuid::new_v4(), Utc::now());

        engine.apply(insert(&ride), Utc::now());

        assert!(engine.known_ride(ride.id).is_none());
        assert!(engine.active_ride().is_none());
        assert!(engine.pool().is_empty());
    }

    #[test]
    fn duplicate_update_is_idempotent() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());
        let accepted = with_status(&ride, RideStatus::Accepted, Some(Uuid::new_v4()));

        engine.apply(insert(&ride), Utc::now());
        engine.apply(update(&accepted), Utc::now());
        let state = engine.active_ride().cloned();

        engine.apply(update(&accepted), Utc::now());

        assert_eq!(engine.active_ride().cloned(), state);
        assert_eq!(edges(engine.drain_notifications()), vec![Edge::Accepted]);
    }

    #[test]
    fn stale_update_does_not_roll_back() {
        let rider = User::rider(Uuid::new_v4());
        let driver = Some(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());

        engine.apply(update(&with_status(&ride, RideStatus::Arrived, driver)), Utc::now());
        engine.apply(update(&with_status(&ride, RideStatus::Accepted, driver)), Utc::now());
        engine.apply(insert(&ride), Utc::now());

        assert_eq!(
            engine.active_ride().map(|r| r.status),
            Some(RideStatus::Arrived)
        );
        assert_eq!(edges(engine.drain_notifications()), vec![Edge::Arrived]);
    }

    #[test]
    fn pool_tracks_searching_rows_only() {
        let mut engine = engine(User::driver(Uuid::new_v4()));
        let ride = searching(Uuid::new_v4(), Utc::now());

        engine.apply(insert(&ride), Utc::now());
        engine.apply(insert(&ride), Utc::now());
        assert_eq!(engine.pool().len(), 1);

        let taken = with_status(&ride, RideStatus::Accepted, Some(Uuid::new_v4()));
        engine.apply(update(&taken), Utc::now());
        assert!(engine.pool().is_empty());
        assert!(engine.active_ride().is_none());

        assert_eq!(edges(engine.drain_notifications()), vec![Edge::Offered]);
    }

    #[test]
    fn late_insert_after_accept_stays_out_of_pool() {
        let mut engine = engine(User::driver(Uuid::new_v4()));
        let ride = searching(Uuid::new_v4(), Utc::now());
        let taken = with_status(&ride, RideStatus::Accepted, Some(Uuid::new_v4()));

        engine.apply(update(&taken), Utc::now());
        engine.apply(insert(&ride), Utc::now());

        assert!(engine.pool().is_empty());
    }

    #[test]
    fn deleted_rows_leave_every_projection() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());

        engine.apply(insert(&ride), Utc::now());
        engine.apply(
            ChangeEvent {
                event_type: EventType::Delete,
                row: ride.clone(),
            },
            Utc::now(),
        );
        engine.apply(insert(&ride), Utc::now());

        assert!(engine.active_ride().is_none());
        assert!(engine.known_ride(ride.id).is_none());
    }

    #[test]
    fn ended_rides_are_dropped_after_retention() {
        let mut engine = engine(User::driver(Uuid::new_v4()));
        let start = Utc::now();
        let ride = searching(Uuid::new_v4(), start);
        let done = with_status(&ride, RideStatus::Completed, Some(Uuid::new_v4()));

        engine.apply(insert(&ride), start);
        engine.apply(update(&done), start);
        engine.drain_notifications();

        engine.tick(start + Duration::minutes(5));
        assert!(engine.known_ride(ride.id).is_some());

        let swept = start + Duration::minutes(10);
        engine.tick(swept);
        assert!(engine.known_ride(ride.id).is_none());

        // replays within the tombstone period stay out
        engine.apply(insert(&ride), swept);
        assert!(engine.pool().is_empty());
        assert!(engine.known_ride(ride.id).is_none());

        engine.tick(swept + Duration::minutes(10));
        assert!(!engine.notifications.has_fired(ride.id, Edge::Offered));
    }

    #[test]
    fn ride_on_the_pointer_is_kept_past_retention() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine_with(
            rider.clone(),
            SessionConfig {
                terminal_linger: None,
                ..SessionConfig::default()
            },
        );
        let start = Utc::now();
        let ride = searching(rider.id, start);

        engine.apply(insert(&ride), start);
        engine.apply(update(&with_status(&ride, RideStatus::Cancelled, None)), start);
        engine.tick(start + Duration::hours(1));

        assert_eq!(engine.active_ride().map(|r| r.id), Some(ride.id));
        assert!(engine.known_ride(ride.id).is_some());
    }

    #[test]
    fn terminal_ride_lingers_then_clears() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());
        let start = Utc::now();

        engine.apply(insert(&ride), start);
        engine.apply(update(&with_status(&ride, RideStatus::Cancelled, None)), start);

        assert_eq!(engine.next_deadline(), Some(start + Duration::seconds(15)));

        engine.tick(start + Duration::seconds(5));
        assert!(engine.active_ride().is_some());

        engine.tick(start + Duration::seconds(15));
        assert!(engine.active_ride().is_none());
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn cleared_ride_does_not_come_back() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());
        let completed = with_status(&ride, RideStatus::Completed, Some(Uuid::new_v4()));

        engine.apply(insert(&ride), Utc::now());
        assert!(engine.clear_ride().unwrap_err().is_invalid_transition_error());

        engine.apply(update(&completed), Utc::now());
        engine.clear_ride().unwrap();

        let mut rated = completed.clone();
        rated.rating = Some(Rating::new(4, None).unwrap());
        engine.apply(update(&rated), Utc::now());
        engine.apply(update(&completed), Utc::now());

        assert!(engine.active_ride().is_none());
        assert_eq!(
            engine.known_ride(ride.id).and_then(|r| r.rating.clone()),
            rated.rating
        );
    }

    #[test]
    fn newer_ride_replaces_finished_one() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let first = searching(rider.id, Utc::now() - Duration::minutes(30));
        let second = searching(rider.id, Utc::now());

        engine.apply(insert(&first), Utc::now());
        engine.apply(update(&with_status(&first, RideStatus::Cancelled, None)), Utc::now());
        engine.apply(insert(&second), Utc::now());

        assert_eq!(engine.active_ride().map(|r| r.id), Some(second.id));

        // replays of the old ride do not take the pointer back
        engine.apply(insert(&first), Utc::now());
        assert_eq!(engine.active_ride().map(|r| r.id), Some(second.id));
    }

    #[test]
    fn resync_replaces_pool_without_renotifying() {
        let mut engine = engine(User::driver(Uuid::new_v4()));
        let stays = searching(Uuid::new_v4(), Utc::now() - Duration::minutes(2));
        let vanished = searching(Uuid::new_v4(), Utc::now() - Duration::minutes(1));
        let fresh = searching(Uuid::new_v4(), Utc::now());

        engine.apply(insert(&stays), Utc::now());
        engine.apply(insert(&vanished), Utc::now());
        engine.drain_notifications();

        engine.resync(
            Snapshot {
                active: None,
                ended: None,
                pool: vec![fresh.clone(), stays.clone()],
            },
            Utc::now(),
        );

        let ids: Vec<Uuid> = engine.pool().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![stays.id, fresh.id]);
        assert_eq!(
            engine.drain_notifications(),
            vec![Notification {
                ride_id: fresh.id,
                edge: Edge::Offered
            }]
        );
    }

    #[test]
    fn resync_surfaces_ride_that_ended_offline() {
        let rider = User::rider(Uuid::new_v4());
        let mut engine = engine(rider.clone());
        let ride = searching(rider.id, Utc::now());
        engine.apply(insert(&ride), Utc::now());

        assert_eq!(engine.stale_pointer(None), Some(ride.id));
        assert_eq!(engine.stale_pointer(Some(&ride)), None);

        let completed = with_status(&ride, RideStatus::Completed, Some(Uuid::new_v4()));
        engine.resync(
            Snapshot {
                active: None,
                ended: Some((ride.id, Some(completed))),
                pool: vec![],
            },
            Utc::now(),
        );

        assert_eq!(
            engine.active_ride().map(|r| r.status),
            Some(RideStatus::Completed)
        );
        assert_eq!(engine.stale_pointer(None), None);
    }

    #[test]
    fn accepted_driver_sees_trip_on_pointer_not_pool() {
        let driver = User::driver(Uuid::new_v4());
        let mut engine = engine(driver.clone());
        let ride = searching(Uuid::new_v4(), Utc::now());

        engine.apply(insert(&ride), Utc::now());
        assert!(engine.current_offer(Utc::now()).is_some());

        engine.apply(
            update(&with_status(&ride, RideStatus::Accepted, Some(driver.id))),
            Utc::now(),
        );

        assert!(engine.pool().is_empty());
        assert_eq!(engine.active_ride().map(|r| r.id), Some(ride.id));
        assert!(engine.current_offer(Utc::now()).is_none());
    }

    #[test]
    fn busy_driver_has_no_past_deadline() {
        let driver = User::driver(Uuid::new_v4());
        let mut engine = engine(driver.clone());
        let start = Utc::now();
        let declined = searching(Uuid::new_v4(), start);
        let taken = searching(Uuid::new_v4(), start);

        engine.apply(insert(&declined), start);
        engine.reject_ride(declined.id, start).unwrap();
        engine.apply(
            update(&with_status(&taken, RideStatus::Accepted, Some(driver.id))),
            start,
        );

        let now = start + Duration::seconds(120);
        engine.tick(now);

        assert!(engine.next_deadline().map_or(true, |deadline| deadline > now));
    }
}
