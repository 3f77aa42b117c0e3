use std::collections::HashMap;

use async_channel::{Receiver, Sender, TrySendError};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    api::{ChangeEvent, ChangeFeed, EventType, Ledger, RideStore, UpdateOutcome},
    auth::User,
    entities::{Category, Change, Precondition, RideRequest},
    error::{conflict_error, not_found_error, Error},
};

/// In-process store and change feed with the same guarantees as `PgStore`:
/// conditional updates are atomic, a rider and a driver each hold at most one
/// open ride, and every committed write is published to subscribers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    rides: HashMap<Uuid, RideRequest>,
    categories: Vec<Category>,
    subscribers: Vec<Sender<ChangeEvent>>,
}

impl State {
    fn publish(&mut self, event_type: EventType, row: &RideRequest) {
        self.subscribers.retain(|subscriber| {
            let event = ChangeEvent {
                event_type,
                row: row.clone(),
            };

            match subscriber.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // a subscriber that cannot keep up loses its subscription
                    tracing::warn!("subscriber lagging, closing its feed");
                    subscriber.close();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn open_ride_of(&self, predicate: impl Fn(&RideRequest) -> bool) -> Option<&RideRequest> {
        self.rides
            .values()
            .find(|ride| !ride.is_terminal() && predicate(ride))
    }
}

impl MemoryStore {
    pub fn new(categories: Vec<Category>) -> Self {
        Self {
            state: Mutex::new(State {
                categories,
                ..State::default()
            }),
        }
    }

    pub async fn ride(&self, id: Uuid) -> Option<RideRequest> {
        self.state.lock().await.rides.get(&id).cloned()
    }

    /// Overwrites a row without any checks, as an operator or another
    /// service writing to the table would.
    pub async fn put_ride(&self, ride: RideRequest) {
        let mut state = self.state.lock().await;
        let event_type = match state.rides.insert(ride.id, ride.clone()) {
            Some(_) => EventType::Update,
            None => EventType::Insert,
        };

        state.publish(event_type, &ride);
    }

    pub async fn delete_ride(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let ride = state.rides.remove(&id).ok_or_else(not_found_error)?;

        state.publish(EventType::Delete, &ride);

        Ok(())
    }

    /// Drops every live subscription, as a lost database connection would.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;

        for subscriber in state.subscribers.drain(..) {
            subscriber.close();
        }
    }
}

#[async_trait]
impl RideStore for MemoryStore {
    #[tracing::instrument(skip(self, ride), fields(ride_id = %ride.id))]
    async fn insert_ride(&self, ride: RideRequest) -> Result<RideRequest, Error> {
        let mut state = self.state.lock().await;

        if state.rides.contains_key(&ride.id)
            || state
                .open_ride_of(|open| open.customer_id == ride.customer_id)
                .is_some()
        {
            return Err(conflict_error());
        }

        state.rides.insert(ride.id, ride.clone());
        state.publish(EventType::Insert, &ride);

        Ok(ride)
    }

    #[tracing::instrument(skip(self, precondition, change))]
    async fn update_ride(
        &self,
        id: Uuid,
        precondition: Precondition,
        change: Change,
    ) -> Result<UpdateOutcome, Error> {
        let mut state = self.state.lock().await;

        let current = state
            .rides
            .get(&id)
            .cloned()
            .ok_or_else(not_found_error)?;

        if !precondition.holds(&current) {
            return Ok(UpdateOutcome::Conflict(Some(current)));
        }

        if let Some(driver_id) = change.driver_id {
            if state
                .open_ride_of(|open| open.id != id && open.is_assigned_to(driver_id))
                .is_some()
            {
                return Err(conflict_error());
            }
        }

        let mut updated = current;
        updated.apply(&change)?;

        state.rides.insert(id, updated.clone());
        state.publish(EventType::Update, &updated);

        Ok(UpdateOutcome::Applied(updated))
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<RideRequest>, Error> {
        Ok(self.ride(id).await)
    }

    async fn find_active_ride(&self, user: &User) -> Result<Option<RideRequest>, Error> {
        let state = self.state.lock().await;

        Ok(state
            .open_ride_of(|ride| ride.customer_id == user.id || ride.is_assigned_to(user.id))
            .cloned())
    }

    async fn list_searching(&self) -> Result<Vec<RideRequest>, Error> {
        let state = self.state.lock().await;

        let mut searching: Vec<RideRequest> = state
            .rides
            .values()
            .filter(|ride| ride.is_searching())
            .cloned()
            .collect();
        searching.sort_by_key(|ride| (ride.created_at, ride.id));

        Ok(searching)
    }

    async fn list_categories(&self) -> Result<Vec<Category>, Error> {
        Ok(self.state.lock().await.categories.clone())
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, capacity: usize) -> Result<Receiver<ChangeEvent>, Error> {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        self.state.lock().await.subscribers.push(sender);

        Ok(receiver)
    }
}

/// Wallet balances held in memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<Uuid, f64>>,
}

impl MemoryLedger {
    pub async fn set_balance(&self, user_id: Uuid, balance: f64) {
        self.balances.lock().await.insert(user_id, balance);
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn balance(&self, user_id: Uuid) -> Result<f64, Error> {
        Ok(self
            .balances
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }
}
