use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use oso::PolarClass;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Place;
use crate::error::{conflict_error, invalid_transition_error, validation_error, Error};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, PolarClass)]
pub struct RideRequest {
    pub id: Uuid,
    #[polar(attribute)]
    pub customer_id: Uuid,
    #[polar(attribute)]
    pub driver_id: Option<Uuid>,
    pub pickup: Place,
    pub destination: Place,
    pub category_id: String,
    pub payment_method: PaymentMethod,
    pub distance_km: f64,
    pub price: f64,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub rating: Option<Rating>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Searching,
    Accepted,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Wallet,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub stars: u8,
    pub comment: Option<String>,
}

/// Caller intents that move a ride along the status graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    Accept,
    ConfirmArrival,
    Start,
    Finish,
    Cancel,
}

/// Row state a conditional update expects to find.
#[derive(Clone, Debug, PartialEq)]
pub struct Precondition {
    pub status: Status,
    pub driver_id: Option<Uuid>,
    pub unrated: bool,
}

/// Fields a conditional update writes. `driver_id` is only ever written once,
/// so `None` leaves the stored value untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub status: Status,
    pub driver_id: Option<Uuid>,
    pub rating: Option<Rating>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub precondition: Precondition,
    pub change: Change,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Searching => "SEARCHING",
            Self::Accepted => "ACCEPTED",
            Self::Arrived => "ARRIVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Position along the lifecycle. Statuses only ever move to a higher rank,
    /// which is what lets snapshots be ordered without a version column.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Searching => 0,
            Self::Accepted => 1,
            Self::Arrived => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Cancelled => 4,
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;

        matches!(
            (self, next),
            (Searching, Accepted)
                | (Searching, Cancelled)
                | (Accepted, Arrived)
                | (Accepted, Cancelled)
                | (Arrived, InProgress)
                | (Arrived, Cancelled)
                | (InProgress, Completed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEARCHING" => Ok(Self::Searching),
            "ACCEPTED" => Ok(Self::Accepted),
            "ARRIVED" => Ok(Self::Arrived),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(validation_error(format!("unknown status {}", s))),
        }
    }
}

impl PaymentMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Wallet => "WALLET",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(Self::Cash),
            "WALLET" => Ok(Self::Wallet),
            _ => Err(validation_error(format!("unknown payment method {}", s))),
        }
    }
}

impl Rating {
    pub fn new(stars: u8, comment: Option<String>) -> Result<Self, Error> {
        if !(1..=5).contains(&stars) {
            return Err(validation_error("rating must be between 1 and 5"));
        }

        Ok(Self { stars, comment })
    }
}

impl Trigger {
    pub fn target(&self) -> Status {
        match self {
            Self::Accept => Status::Accepted,
            Self::ConfirmArrival => Status::Arrived,
            Self::Start => Status::InProgress,
            Self::Finish => Status::Completed,
            Self::Cancel => Status::Cancelled,
        }
    }

    /// Action name checked against the authorization policy.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::ConfirmArrival => "confirm_arrival",
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Cancel => "cancel",
        }
    }
}

impl Precondition {
    pub fn holds(&self, ride: &RideRequest) -> bool {
        ride.status == self.status
            && ride.driver_id == self.driver_id
            && (!self.unrated || ride.rating.is_none())
    }
}

impl RideRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        customer_id: Uuid,
        pickup: Place,
        destination: Place,
        category_id: String,
        payment_method: PaymentMethod,
        distance_km: f64,
        price: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            driver_id: None,
            pickup,
            destination,
            category_id,
            payment_method,
            distance_km,
            price,
            status: Status::Searching,
            created_at,
            rating: None,
        }
    }

    pub fn is_searching(&self) -> bool {
        self.status == Status::Searching
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_assigned_to(&self, driver_id: Uuid) -> bool {
        self.driver_id == Some(driver_id)
    }

    /// Builds the conditional update for `trigger` from the last known state of
    /// this ride. The store still has the final word: the precondition pins the
    /// status and driver this plan was made against.
    #[tracing::instrument(skip(self), fields(ride_id = %self.id, status = %self.status))]
    pub fn plan(&self, trigger: Trigger, actor_id: Uuid) -> Result<Transition, Error> {
        let target = trigger.target();

        if !self.status.can_transition_to(target) {
            return Err(invalid_transition_error());
        }

        let driver_id = match trigger {
            Trigger::Accept => {
                if self.driver_id.is_some() {
                    return Err(conflict_error());
                }
                Some(actor_id)
            }
            _ => None,
        };

        Ok(Transition {
            precondition: Precondition {
                status: self.status,
                driver_id: self.driver_id,
                unrated: false,
            },
            change: Change {
                status: target,
                driver_id,
                rating: None,
            },
        })
    }

    pub fn plan_rating(&self, rating: Rating) -> Result<Transition, Error> {
        if self.status != Status::Completed {
            return Err(invalid_transition_error());
        }

        if self.rating.is_some() {
            return Err(conflict_error());
        }

        Ok(Transition {
            precondition: Precondition {
                status: Status::Completed,
                driver_id: self.driver_id,
                unrated: true,
            },
            change: Change {
                status: Status::Completed,
                driver_id: None,
                rating: Some(rating),
            },
        })
    }

    /// Writes `change` after re-checking the status graph. Stores call this
    /// once the precondition has been verified against the current row.
    pub fn apply(&mut self, change: &Change) -> Result<(), Error> {
        if change.status != self.status && !self.status.can_transition_to(change.status) {
            return Err(invalid_transition_error());
        }

        if let Some(driver_id) = change.driver_id {
            if self.driver_id.is_some() {
                return Err(conflict_error());
            }
            self.driver_id = Some(driver_id);
        }

        if let Some(rating) = &change.rating {
            if self.status != Status::Completed || self.rating.is_some() {
                return Err(invalid_transition_error());
            }
            self.rating = Some(rating.clone());
        }

        self.status = change.status;

        Ok(())
    }

    /// Whether this snapshot of a ride is more recent than `other`, a snapshot
    /// of the same ride. Identical snapshots never supersede each other.
    pub fn supersedes(&self, other: &RideRequest) -> bool {
        if self.status.rank() != other.status.rank() {
            return self.status.rank() > other.status.rank();
        }

        self.status == other.status && self.rating.is_some() && other.rating.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Coordinates;

    fn ride() -> RideRequest {
        let place = Place::new("Main St 1", Coordinates { lat: 0.0, lng: 0.0 });

        RideRequest::new(
            Uuid::new_v4(),
            place.clone(),
            place,
            "standard".into(),
            PaymentMethod::Cash,
            4.0,
            12.0,
            Utc::now(),
        )
    }

    fn step(ride: &mut RideRequest, trigger: Trigger, actor: Uuid) -> Result<(), Error> {
        let transition = ride.plan(trigger, actor)?;
        assert!(transition.precondition.holds(ride));
        ride.apply(&transition.change)
    }

    #[test]
    fn full_lifecycle() {
        let driver = Uuid::new_v4();
        let mut ride = ride();

        step(&mut ride, Trigger::Accept, driver).unwrap();
        assert_eq!(ride.status, Status::Accepted);
        assert_eq!(ride.driver_id, Some(driver));

        step(&mut ride, Trigger::ConfirmArrival, driver).unwrap();
        step(&mut ride, Trigger::Start, driver).unwrap();
        step(&mut ride, Trigger::Finish, driver).unwrap();
        assert_eq!(ride.status, Status::Completed);

        let rating = ride.plan_rating(Rating::new(5, None).unwrap()).unwrap();
        ride.apply(&rating.change).unwrap();
        assert_eq!(ride.rating.as_ref().map(|r| r.stars), Some(5));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        let driver = Uuid::new_v4();

        for terminal in [Status::Completed, Status::Cancelled] {
            let mut ride = ride();
            ride.status = terminal;

            for trigger in [
                Trigger::Accept,
                Trigger::ConfirmArrival,
                Trigger::Start,
                Trigger::Finish,
                Trigger::Cancel,
            ] {
                let err = ride.plan(trigger, driver).unwrap_err();
                assert!(err.is_invalid_transition_error());
            }
        }
    }

    #[test]
    fn arrival_cannot_be_skipped() {
        let driver = Uuid::new_v4();
        let mut ride = ride();

        step(&mut ride, Trigger::Accept, driver).unwrap();

        let err = ride.plan(Trigger::Start, driver).unwrap_err();
        assert!(err.is_invalid_transition_error());

        let err = ride.plan(Trigger::Finish, driver).unwrap_err();
        assert!(err.is_invalid_transition_error());
    }

    #[test]
    fn in_progress_rides_cannot_be_cancelled() {
        let driver = Uuid::new_v4();
        let mut ride = ride();

        step(&mut ride, Trigger::Accept, driver).unwrap();
        step(&mut ride, Trigger::ConfirmArrival, driver).unwrap();
        step(&mut ride, Trigger::Start, driver).unwrap();

        assert!(ride.plan(Trigger::Cancel, driver).is_err());
    }

    #[test]
    fn accept_pins_null_driver() {
        let ride = ride();
        let transition = ride.plan(Trigger::Accept, Uuid::new_v4()).unwrap();

        assert_eq!(transition.precondition.status, Status::Searching);
        assert_eq!(transition.precondition.driver_id, None);

        let mut taken = ride.clone();
        taken.driver_id = Some(Uuid::new_v4());
        assert!(!transition.precondition.holds(&taken));
    }

    #[test]
    fn rating_only_once_and_only_when_completed() {
        let mut ride = ride();
        let rating = Rating::new(4, Some("smooth".into())).unwrap();

        assert!(ride
            .plan_rating(rating.clone())
            .unwrap_err()
            .is_invalid_transition_error());

        ride.status = Status::Completed;
        ride.rating = Some(rating.clone());

        assert!(ride.plan_rating(rating).unwrap_err().is_conflict_error());
        assert!(Rating::new(0, None).unwrap_err().is_validation_error());
        assert!(Rating::new(6, None).unwrap_err().is_validation_error());
    }

    #[test]
    fn supersedes_follows_lifecycle_rank() {
        let searching = ride();

        let mut accepted = searching.clone();
        accepted.status = Status::Accepted;
        accepted.driver_id = Some(Uuid::new_v4());

        let mut cancelled = accepted.clone();
        cancelled.status = Status::Cancelled;

        assert!(accepted.supersedes(&searching));
        assert!(cancelled.supersedes(&accepted));
        assert!(!searching.supersedes(&accepted));
        assert!(!accepted.supersedes(&accepted.clone()));

        let mut completed = accepted.clone();
        completed.status = Status::Completed;
        assert!(!completed.supersedes(&cancelled));
        assert!(!cancelled.supersedes(&completed));

        let mut rated = completed.clone();
        rated.rating = Some(Rating::new(3, None).unwrap());
        assert!(rated.supersedes(&completed));
        assert!(!completed.supersedes(&rated));
    }

    #[test]
    fn status_names_round_trip_through_storage() {
        for status in [
            Status::Searching,
            Status::Accepted,
            Status::Arrived,
            Status::InProgress,
            Status::Completed,
            Status::Cancelled,
        ] {
            assert_eq!(status.name().parse::<Status>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.name())
            );
        }
    }
}
