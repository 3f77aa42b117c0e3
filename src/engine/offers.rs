use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pool::MatchingPool;
use crate::entities::RideRequest;

/// The request currently put in front of a driver, until it is answered or
/// its response window closes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub ride: RideRequest,
    pub expires_at: DateTime<Utc>,
}

/// Local bookkeeping of offers. Nothing here touches shared state: rejecting or
/// letting an offer lapse only hides the request from this driver for a while.
#[derive(Debug)]
pub struct OfferDesk {
    window: Duration,
    cooldown: Duration,
    current: Option<Offer>,
    cooling: HashMap<Uuid, DateTime<Utc>>,
}

impl OfferDesk {
    pub fn new(window: Duration, cooldown: Duration) -> Self {
        Self {
            window,
            cooldown,
            current: None,
            cooling: HashMap::new(),
        }
    }

    /// When the offer lapses or, with nothing on offer, when the next cooled
    /// down request becomes eligible again.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match &self.current {
            Some(offer) => Some(offer.expires_at),
            None => self.cooling.values().min().copied(),
        }
    }

    /// Expires a lapsed offer, drops one whose request left the pool, and puts
    /// the oldest eligible request up when nothing is on offer.
    pub fn refresh(&mut self, pool: &MatchingPool, now: DateTime<Utc>) -> Option<&Offer> {
        self.cooling.retain(|_, until| *until > now);

        if let Some(offer) = self.current.take() {
            if offer.expires_at <= now {
                tracing::info!(ride_id = %offer.ride.id, "offer expired");
                self.cooling.insert(offer.ride.id, now + self.cooldown);
            } else if pool.contains(offer.ride.id) {
                self.current = Some(offer);
            }
        }

        if self.current.is_none() {
            self.current = pool
                .iter()
                .find(|ride| !self.is_cooling(ride.id))
                .map(|ride| Offer {
                    ride: ride.clone(),
                    expires_at: now + self.window,
                });
        }

        self.current.as_ref()
    }

    pub fn reject(&mut self, id: Uuid, now: DateTime<Utc>) {
        self.cooling.insert(id, now + self.cooldown);

        if self.current.as_ref().map(|offer| offer.ride.id) == Some(id) {
            self.current = None;
        }
    }

    pub fn withdraw(&mut self) {
        self.current = None;
    }

    pub fn is_cooling(&self, id: Uuid) -> bool {
        self.cooling.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Coordinates, PaymentMethod, Place};

    fn request(offset: i64, base: DateTime<Utc>) -> RideRequest {
        let place = Place::new("Pier 9", Coordinates { lat: 2.0, lng: 2.0 });

        RideRequest::new(
            Uuid::new_v4(),
            place.clone(),
            place,
            "standard".into(),
            PaymentMethod::Cash,
            2.0,
            8.0,
            base + Duration::seconds(offset),
        )
    }

    fn desk() -> OfferDesk {
        OfferDesk::new(Duration::seconds(60), Duration::seconds(120))
    }

    #[test]
    fn offers_oldest_request_first() {
        let now = Utc::now();
        let mut pool = MatchingPool::new();
        let (old, new) = (request(-30, now), request(-10, now));
        pool.on_inserted(&new);
        pool.on_inserted(&old);

        let mut desk = desk();
        let offer = desk.refresh(&pool, now).cloned().unwrap();

        assert_eq!(offer.ride.id, old.id);
        assert_eq!(offer.expires_at, now + Duration::seconds(60));
    }

    #[test]
    fn lapsed_offer_moves_on_and_cools_down() {
        let now = Utc::now();
        let mut pool = MatchingPool::new();
        let (first, second) = (request(-30, now), request(-10, now));
        pool.on_inserted(&first);
        pool.on_inserted(&second);

        let mut desk = desk();
        desk.refresh(&pool, now);

        let later = now + Duration::seconds(61);
        let offer = desk.refresh(&pool, later).cloned().unwrap();

        assert_eq!(offer.ride.id, second.id);
        assert!(desk.is_cooling(first.id));
        assert!(pool.contains(first.id));
    }

    #[test]
    fn rejection_hides_request_until_cooldown_passes() {
        let now = Utc::now();
        let mut pool = MatchingPool::new();
        let only = request(-5, now);
        pool.on_inserted(&only);

        let mut desk = desk();
        desk.refresh(&pool, now);
        desk.reject(only.id, now);

        assert_eq!(desk.deadline(), Some(now + Duration::seconds(120)));
        assert!(desk.refresh(&pool, now + Duration::seconds(10)).is_none());

        let offer = desk.refresh(&pool, now + Duration::seconds(121)).cloned();
        assert_eq!(offer.map(|o| o.ride.id), Some(only.id));
    }

    #[test]
    fn offer_is_dropped_when_request_leaves_pool() {
        let now = Utc::now();
        let mut pool = MatchingPool::new();
        let only = request(-5, now);
        pool.on_inserted(&only);

        let mut desk = desk();
        desk.refresh(&pool, now);
        pool.remove(only.id);

        assert!(desk.refresh(&pool, now).is_none());
        assert!(!desk.is_cooling(only.id));
    }
}
