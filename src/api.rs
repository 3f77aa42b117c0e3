use std::sync::Arc;

use async_channel::Receiver;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::User;
use crate::engine::Offer;
use crate::entities::{Category, Change, PaymentMethod, Place, Precondition, Rating, RideRequest};
use crate::error::Error;

/// Result of a conditional write. A failed precondition is an ordinary outcome,
/// carrying the row as the store currently holds it when there is one.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    Applied(RideRequest),
    Conflict(Option<RideRequest>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// One change-feed delivery: always the full row, never a diff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub row: RideRequest,
}

#[async_trait]
pub trait RideStore: Send + Sync {
    async fn insert_ride(&self, ride: RideRequest) -> Result<RideRequest, Error>;

    async fn update_ride(
        &self,
        id: Uuid,
        precondition: Precondition,
        change: Change,
    ) -> Result<UpdateOutcome, Error>;

    async fn find_ride(&self, id: Uuid) -> Result<Option<RideRequest>, Error>;

    /// The caller's non-terminal ride, as customer or as assigned driver.
    async fn find_active_ride(&self, user: &User) -> Result<Option<RideRequest>, Error>;

    async fn list_searching(&self) -> Result<Vec<RideRequest>, Error>;

    async fn list_categories(&self) -> Result<Vec<Category>, Error>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a subscription. The receiver closing means the subscription was
    /// lost and events from then on are gone, not queued.
    async fn subscribe(&self, capacity: usize) -> Result<Receiver<ChangeEvent>, Error>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, user_id: Uuid) -> Result<f64, Error>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideDraft {
    pub pickup: Place,
    pub destination: Place,
    pub category_id: String,
    pub payment_method: PaymentMethod,
    pub distance_km: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    Submitted { ride: RideRequest },
    InsufficientFunds { missing_amount: f64 },
}

#[async_trait]
pub trait RideAPI {
    async fn request_ride(&self, draft: RideDraft) -> Result<RequestOutcome, Error>;
    async fn accept_ride(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn reject_ride(&self, id: Uuid) -> Result<(), Error>;
    async fn confirm_arrival(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn start_ride(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn finish_ride(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn cancel_ride(&self, id: Uuid) -> Result<RideRequest, Error>;
    async fn rate_ride(&self, id: Uuid, rating: Rating) -> Result<RideRequest, Error>;
    async fn clear_ride(&self) -> Result<(), Error>;
    async fn active_ride(&self) -> Result<Option<RideRequest>, Error>;
    async fn pool(&self) -> Result<Vec<RideRequest>, Error>;
    async fn current_offer(&self) -> Result<Option<Offer>, Error>;
    async fn quote(&self, category_id: String, distance_km: f64) -> Result<f64, Error>;
}

pub type DynRideAPI = Arc<dyn RideAPI + Send + Sync>;
