use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Engine;
use crate::{
    api::{RequestOutcome, RideDraft, RideStore, UpdateOutcome},
    auth::Platform,
    balance::{self, Affordability},
    entities::{PaymentMethod, Rating, RideRequest, Transition, Trigger},
    error::{conflict_error, network_error, not_found_error, superseded_error, validation_error, Error},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Request,
    Transition(Trigger),
    Rate,
}

/// A store call planned by the session. Running it is the only part that
/// leaves the dispatch loop; its result comes back through `Engine::complete`.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Insert(RideRequest),
    Update {
        ride_id: Uuid,
        intent: Intent,
        transition: Transition,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Prepared {
    Submit(Action),
    Declined(RequestOutcome),
}

impl Action {
    pub fn ride_id(&self) -> Uuid {
        match self {
            Self::Insert(ride) => ride.id,
            Self::Update { ride_id, .. } => *ride_id,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            Self::Insert(_) => Intent::Request,
            Self::Update { intent, .. } => *intent,
        }
    }

    pub async fn execute(&self, store: &dyn RideStore) -> Result<UpdateOutcome, Error> {
        match self {
            Self::Insert(ride) => store
                .insert_ride(ride.clone())
                .await
                .map(UpdateOutcome::Applied),
            Self::Update {
                ride_id,
                transition,
                ..
            } => {
                store
                    .update_ride(
                        *ride_id,
                        transition.precondition.clone(),
                        transition.change.clone(),
                    )
                    .await
            }
        }
    }
}

impl Engine {
    #[tracing::instrument(skip(self, draft), fields(category_id = %draft.category_id))]
    pub fn prepare_request(
        &mut self,
        draft: RideDraft,
        now: DateTime<Utc>,
    ) -> Result<Prepared, Error> {
        self.authorize(self.user.clone(), "request", Platform::default())?;

        if draft.pickup.is_blank() || draft.destination.is_blank() {
            return Err(validation_error("pickup and destination are required"));
        }

        if self.has_open_ride() {
            tracing::info!("rider already has an open ride");
            return Err(conflict_error());
        }

        if self.catalog.is_empty() {
            return Err(network_error("categories not loaded"));
        }

        let price = self.catalog.quote(&draft.category_id, draft.distance_km)?;

        if price <= 0.0 {
            return Err(validation_error("trip has no price"));
        }

        if draft.payment_method == PaymentMethod::Wallet {
            let balance = self
                .balance
                .ok_or_else(|| network_error("wallet balance unavailable"))?;

            if let Affordability::InsufficientFunds { missing_amount } =
                balance::check(draft.payment_method, balance, price)
            {
                tracing::info!(balance, price, missing_amount, "wallet cannot cover the trip");
                return Ok(Prepared::Declined(RequestOutcome::InsufficientFunds {
                    missing_amount,
                }));
            }
        }

        let ride = RideRequest::new(
            self.user.id,
            draft.pickup,
            draft.destination,
            draft.category_id,
            draft.payment_method,
            draft.distance_km,
            price,
            now,
        );

        Ok(Prepared::Submit(Action::Insert(ride)))
    }

    #[tracing::instrument(skip(self))]
    pub fn prepare_transition(&mut self, id: Uuid, trigger: Trigger) -> Result<Action, Error> {
        let ride = match trigger {
            Trigger::Accept => self.acceptable(id)?,
            _ => self
                .known
                .get(&id)
                .cloned()
                .ok_or_else(not_found_error)?,
        };

        self.authorize(self.user.clone(), trigger.action(), ride.clone())?;

        let transition = ride.plan(trigger, self.user.id)?;

        Ok(Action::Update {
            ride_id: id,
            intent: Intent::Transition(trigger),
            transition,
        })
    }

    #[tracing::instrument(skip(self, rating))]
    pub fn prepare_rating(&mut self, id: Uuid, rating: Rating) -> Result<Action, Error> {
        let ride = self
            .known
            .get(&id)
            .cloned()
            .ok_or_else(not_found_error)?;

        self.authorize(self.user.clone(), "rate", ride.clone())?;

        let transition = ride.plan_rating(rating)?;

        Ok(Action::Update {
            ride_id: id,
            intent: Intent::Rate,
            transition,
        })
    }

    fn acceptable(&mut self, id: Uuid) -> Result<RideRequest, Error> {
        if self.has_open_ride() {
            tracing::info!("driver already has an open ride");
            return Err(conflict_error());
        }

        if let Some(ride) = self.pool.get(id) {
            return Ok(ride.clone());
        }

        match self.known.get(&id) {
            Some(_) => {
                self.offers.withdraw();
                Err(conflict_error())
            }
            None => Err(not_found_error()),
        }
    }

    /// Applies the result of an action. The returned row is treated like any
    /// feed snapshot, so a result that lost against a change already seen is
    /// discarded and reported as superseded.
    #[tracing::instrument(skip(self, action, result), fields(ride_id = %action.ride_id(), intent = ?action.intent()))]
    pub fn complete(
        &mut self,
        action: &Action,
        result: Result<UpdateOutcome, Error>,
        now: DateTime<Utc>,
    ) -> Result<RideRequest, Error> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_conflict_error() {
                    self.drop_lost_accept(action);
                }
                return Err(err);
            }
        };

        match outcome {
            UpdateOutcome::Applied(row) => {
                self.absorb(row.clone(), now);

                match self.known.get(&row.id) {
                    Some(current) if current.supersedes(&row) => {
                        tracing::info!(status = %current.status, "result superseded, discarding");
                        Err(superseded_error())
                    }
                    _ => Ok(row),
                }
            }
            UpdateOutcome::Conflict(current) => {
                if let Some(row) = current {
                    self.absorb(row, now);
                }
                self.drop_lost_accept(action);

                tracing::info!("conditional update lost");
                Err(conflict_error())
            }
        }
    }

    fn drop_lost_accept(&mut self, action: &Action) {
        if action.intent() == Intent::Transition(Trigger::Accept) {
            self.pool.remove(action.ride_id());
            self.offers.withdraw();
        }
    }
}
