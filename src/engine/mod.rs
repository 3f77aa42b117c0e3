mod actions;
mod catalog;
mod notifications;
mod offers;
mod pool;
mod reconcile;
mod runner;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use oso::Oso;
use uuid::Uuid;

use crate::{
    auth::{authorizor, User},
    entities::{Category, RideRequest},
    error::{invalid_transition_error, unauthorized_error, Error},
};

pub use actions::{Action, Intent, Prepared};
pub use catalog::Catalog;
pub use notifications::{Edge, Notification};
pub use offers::Offer;
pub use pool::MatchingPool;
pub use reconcile::Snapshot;
pub use runner::{RunnerSettings, Session, SessionHandle};

use notifications::NotificationLog;
use offers::OfferDesk;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub offer_window: Duration,
    pub rejection_cooldown: Duration,
    /// How long a finished or cancelled ride stays on screen before the
    /// pointer clears by itself. `None` waits for an explicit clear.
    pub terminal_linger: Option<Duration>,
    /// How long ended rides are remembered, and then how long their ids keep
    /// replays out.
    pub retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offer_window: Duration::seconds(60),
            rejection_cooldown: Duration::seconds(60),
            terminal_linger: Some(Duration::seconds(15)),
            retention: Duration::minutes(10),
        }
    }
}

/// State of one rider or driver session. Every method is synchronous and
/// takes `&mut self`; the session's dispatch loop is the only caller, which
/// is what keeps the projections free of locks.
pub struct Engine {
    user: User,
    authorizor: Oso,
    config: SessionConfig,
    catalog: Catalog,
    balance: Option<f64>,
    active: Option<RideRequest>,
    terminal_since: Option<DateTime<Utc>>,
    pool: MatchingPool,
    known: HashMap<Uuid, RideRequest>,
    ended: HashMap<Uuid, DateTime<Utc>>,
    tombstones: HashMap<Uuid, DateTime<Utc>>,
    notifications: NotificationLog,
    offers: OfferDesk,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all, fields(user_id = %user.id, role = ?user.role))]
    pub fn new(user: User, config: SessionConfig) -> Result<Self, Error> {
        let offers = OfferDesk::new(config.offer_window, config.rejection_cooldown);

        Ok(Self {
            user,
            authorizor: authorizor::new()?,
            config,
            catalog: Catalog::default(),
            balance: None,
            active: None,
            terminal_since: None,
            pool: MatchingPool::new(),
            known: HashMap::new(),
            ended: HashMap::new(),
            tombstones: HashMap::new(),
            notifications: NotificationLog::default(),
            offers,
        })
    }

    pub fn authorize<Actor, Action, Resource>(
        &self,
        actor: Actor,
        action: Action,
        resource: Resource,
    ) -> Result<(), Error>
    where
        Actor: oso::ToPolar,
        Action: oso::ToPolar,
        Resource: oso::ToPolar,
    {
        if self.authorizor.is_allowed(actor, action, resource)? {
            return Ok(());
        }

        Err(unauthorized_error())
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn active_ride(&self) -> Option<&RideRequest> {
        self.active.as_ref()
    }

    pub fn pool(&self) -> &MatchingPool {
        &self.pool
    }

    pub fn known_ride(&self, id: Uuid) -> Option<&RideRequest> {
        self.known.get(&id)
    }

    pub fn balance(&self) -> Option<f64> {
        self.balance
    }

    pub fn set_balance(&mut self, balance: Option<f64>) {
        self.balance = balance;
    }

    pub fn set_catalog(&mut self, categories: Vec<Category>) {
        self.catalog.replace(categories);
    }

    pub fn quote(&self, category_id: &str, distance_km: f64) -> Result<f64, Error> {
        self.catalog.quote(category_id, distance_km)
    }

    /// Whether the session is tied up in a trip that has not ended yet.
    pub fn has_open_ride(&self) -> bool {
        self.active.as_ref().map_or(false, |ride| !ride.is_terminal())
    }

    /// Resets the pointer once its terminal status has been shown.
    #[tracing::instrument(skip(self))]
    pub fn clear_ride(&mut self) -> Result<(), Error> {
        if self.has_open_ride() {
            return Err(invalid_transition_error());
        }

        self.active = None;
        self.terminal_since = None;

        Ok(())
    }

    /// Declines a request for this driver only; the request stays in the pool
    /// of every other driver.
    #[tracing::instrument(skip(self))]
    pub fn reject_ride(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        if !self.user.is_driver() {
            return Err(unauthorized_error());
        }

        self.offers.reject(id, now);

        Ok(())
    }

    /// The request currently offered to this driver, if any. Drivers busy
    /// with a trip are not offered anything.
    pub fn current_offer(&mut self, now: DateTime<Utc>) -> Option<Offer> {
        if !self.user.is_driver() || self.has_open_ride() {
            self.offers.withdraw();
            return None;
        }

        self.offers.refresh(&self.pool, now).cloned()
    }

    /// Earliest moment at which `tick` has something to do.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let linger = self
            .terminal_since
            .zip(self.config.terminal_linger)
            .map(|(since, linger)| since + linger);

        // a busy driver is not offered anything, so offer timers do not apply
        let offer = self
            .offers
            .deadline()
            .filter(|_| self.user.is_driver() && !self.has_open_ride());

        match (offer, linger) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) {
        if let (Some(since), Some(linger)) = (self.terminal_since, self.config.terminal_linger) {
            if since + linger <= now {
                tracing::debug!("terminal ride lingered long enough, clearing");
                self.active = None;
                self.terminal_since = None;
            }
        }

        self.sweep(now);
        self.current_offer(now);
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::{Engine, SessionConfig};
    use crate::api::{ChangeEvent, EventType, RideDraft};
    use crate::auth::User;
    use crate::entities::{Category, Coordinates, PaymentMethod, Place, RideRequest, RideStatus};

    pub fn engine(user: User) -> Engine {
        engine_with(user, SessionConfig::default())
    }

    pub fn engine_with(user: User, config: SessionConfig) -> Engine {
        let mut engine = Engine::new(user, config).unwrap();
        engine.set_catalog(vec![Category::metered("standard", 5.0, 2.5, 8.0)]);
        engine
    }

    pub fn draft(payment_method: PaymentMethod, distance_km: f64) -> RideDraft {
        RideDraft {
            pickup: Place::new("Station Sq", Coordinates { lat: 1.0, lng: 1.0 }),
            destination: Place::new("Old Town", Coordinates { lat: 1.1, lng: 1.1 }),
            category_id: "standard".into(),
            payment_method,
            distance_km,
        }
    }

    pub fn searching(customer_id: Uuid, created_at: DateTime<Utc>) -> RideRequest {
        let draft = draft(PaymentMethod::Cash, 4.0);

        RideRequest::new(
            customer_id,
            draft.pickup,
            draft.destination,
            draft.category_id,
            draft.payment_method,
            draft.distance_km,
            15.0,
            created_at,
        )
    }

    pub fn with_status(ride: &RideRequest, status: RideStatus, driver_id: Option<Uuid>) -> RideRequest {
        let mut ride = ride.clone();
        ride.status = status;
        ride.driver_id = driver_id;
        ride
    }

    pub fn insert(row: &RideRequest) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::Insert,
            row: row.clone(),
        }
    }

    pub fn update(row: &RideRequest) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::Update,
            row: row.clone(),
        }
    }
}
