//! Drives many driver sessions against one request to exercise the accept
//! race end to end, with randomized store latency per driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rand_distr::{Distribution, Normal};
use uuid::Uuid;

use crate::{
    api::{RequestOutcome, RideAPI, RideDraft, RideStore, UpdateOutcome},
    auth::User,
    engine::{Engine, RunnerSettings, Session, SessionConfig, SessionHandle},
    entities::{Category, Change, Coordinates, PaymentMethod, Place, Precondition, RideRequest},
    error::{network_error, unexpected_error, validation_error, Error},
    memory::MemoryStore,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RaceReport {
    pub ride_id: Uuid,
    pub winner: Option<Uuid>,
    pub conflicts: usize,
    pub other_errors: usize,
    /// Whether every driver's pool was empty once the race settled.
    pub pools_empty: bool,
}

/// Store wrapper that holds every write back for a fixed latency.
struct Delayed {
    inner: Arc<MemoryStore>,
    latency: Duration,
}

#[async_trait]
impl RideStore for Delayed {
    async fn insert_ride(&self, ride: RideRequest) -> Result<RideRequest, Error> {
        tokio::time::sleep(self.latency).await;
        self.inner.insert_ride(ride).await
    }

    async fn update_ride(
        &self,
        id: Uuid,
        precondition: Precondition,
        change: Change,
    ) -> Result<UpdateOutcome, Error> {
        tokio::time::sleep(self.latency).await;
        self.inner.update_ride(id, precondition, change).await
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<RideRequest>, Error> {
        self.inner.find_ride(id).await
    }

    async fn find_active_ride(&self, user: &User) -> Result<Option<RideRequest>, Error> {
        self.inner.find_active_ride(user).await
    }

    async fn list_searching(&self) -> Result<Vec<RideRequest>, Error> {
        self.inner.list_searching().await
    }

    async fn list_categories(&self) -> Result<Vec<Category>, Error> {
        self.inner.list_categories().await
    }
}

#[tracing::instrument(skip(handle))]
async fn wait_for_pool(handle: &SessionHandle, ride_id: Uuid) -> Result<(), Error> {
    for _ in 0..400 {
        if handle.pool().await?.iter().any(|ride| ride.id == ride_id) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    Err(network_error("request never reached the pool"))
}

#[tracing::instrument]
pub async fn accept_race(drivers: usize, mean_latency_ms: f64) -> Result<RaceReport, Error> {
    let store = Arc::new(MemoryStore::new(vec![Category::metered(
        "standard", 5.0, 2.5, 8.0,
    )]));

    if !(mean_latency_ms >= 0.0 && mean_latency_ms.is_finite()) {
        return Err(validation_error("latency must be a non-negative number"));
    }

    let latency = Normal::new(mean_latency_ms, mean_latency_ms / 4.0)
        .map_err(|_| validation_error("latency must be a non-negative number"))?;
    let latencies: Vec<Duration> = {
        let mut rng = rand::thread_rng();
        (0..drivers)
            .map(|_| Duration::from_micros((latency.sample(&mut rng).max(0.0) * 1000.0) as u64))
            .collect()
    };

    let rider = Session::spawn(
        Engine::new(User::rider(Uuid::new_v4()), SessionConfig::default())?,
        store.clone(),
        store.clone(),
        None,
        RunnerSettings::default(),
    );

    let mut sessions = Vec::with_capacity(drivers);
    for latency in latencies {
        let driver = User::driver(Uuid::new_v4());
        let delayed = Arc::new(Delayed {
            inner: store.clone(),
            latency,
        });

        sessions.push((
            driver.id,
            Session::spawn(
                Engine::new(driver, SessionConfig::default())?,
                delayed,
                store.clone(),
                None,
                RunnerSettings::default(),
            ),
        ));
    }

    let place = Place::new("Harbour Rd 2", Coordinates { lat: 0.0, lng: 0.0 });
    let draft = RideDraft {
        pickup: place.clone(),
        destination: place,
        category_id: "standard".into(),
        payment_method: PaymentMethod::Cash,
        distance_km: 4.0,
    };

    let ride_id = match rider.handle.request_ride(draft).await? {
        RequestOutcome::Submitted { ride } => ride.id,
        RequestOutcome::InsufficientFunds { .. } => return Err(unexpected_error()),
    };

    for (_, session) in &sessions {
        wait_for_pool(&session.handle, ride_id).await?;
    }

    tracing::info!(%ride_id, drivers, started_at = %Utc::now(), "accept race started");

    let results = join_all(
        sessions
            .iter()
            .map(|(_, session)| session.handle.accept_ride(ride_id)),
    )
    .await;

    let mut report = RaceReport {
        ride_id,
        winner: None,
        conflicts: 0,
        other_errors: 0,
        pools_empty: true,
    };

    for ((driver_id, _), result) in sessions.iter().zip(results) {
        match result {
            Ok(_) => report.winner = Some(*driver_id),
            Err(err) if err.is_conflict_error() => report.conflicts += 1,
            Err(err) => {
                tracing::warn!(%driver_id, %err, "accept failed");
                report.other_errors += 1;
            }
        }
    }

    for (_, session) in &sessions {
        report.pools_empty &= session.handle.pool().await?.is_empty();
    }

    tracing::info!(?report, "accept race settled");

    Ok(report)
}

#[tokio::test]
async fn exactly_one_driver_wins_the_race() {
    let report = accept_race(8, 3.0).await.unwrap();

    assert!(report.winner.is_some());
    assert_eq!(report.conflicts, 7);
    assert_eq!(report.other_errors, 0);
    assert!(report.pools_empty);
}

#[tokio::test]
async fn negative_latency_is_rejected() {
    let err = accept_race(2, -1.0).await.unwrap_err();

    assert!(err.is_validation_error());
    assert!(accept_race(2, f64::NAN).await.unwrap_err().is_validation_error());
}
