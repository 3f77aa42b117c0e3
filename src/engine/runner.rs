use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, RecvError, SendError, Sender};
use async_trait::async_trait;
use chrono::Utc;
use futures::future;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Action, Edge, Engine, Notification, Offer, Prepared, Snapshot};
use crate::{
    api::{ChangeEvent, ChangeFeed, Ledger, RequestOutcome, RideAPI, RideDraft, RideStore, UpdateOutcome},
    entities::{PaymentMethod, Rating, RideRequest, Trigger},
    error::{network_error, Error},
};

/// Sleep used when the engine has no deadline pending.
const IDLE: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub feed_capacity: usize,
    pub command_capacity: usize,
    pub notification_capacity: usize,
    /// Notifications held back while the receiver is full. Past this the
    /// oldest are dropped.
    pub notification_backlog: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            feed_capacity: 256,
            command_capacity: 64,
            notification_capacity: 64,
            notification_backlog: 1024,
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

enum Command {
    Request { draft: RideDraft, reply: Reply<RequestOutcome> },
    Transition { id: Uuid, trigger: Trigger, reply: Reply<RideRequest> },
    Rate { id: Uuid, rating: Rating, reply: Reply<RideRequest> },
    Reject { id: Uuid, reply: Reply<()> },
    Clear { reply: Reply<()> },
    ActiveRide { reply: Reply<Option<RideRequest>> },
    Pool { reply: Reply<Vec<RideRequest>> },
    CurrentOffer { reply: Reply<Option<Offer>> },
    Quote { category_id: String, distance_km: f64, reply: Reply<f64> },
}

enum Responder {
    Ride(Reply<RideRequest>),
    Request(Reply<RequestOutcome>),
}

struct Completion {
    ticket: u64,
    result: Result<UpdateOutcome, Error>,
}

/// Dispatch loop owning one `Engine`. Commands, feed events, store results
/// and timers are handled one at a time; store calls themselves run on
/// spawned tasks so a slow write never holds up the feed. Commands keep being
/// answered while the feed is down and a resubscription is pending.
struct Runner {
    engine: Engine,
    store: Arc<dyn RideStore>,
    feed: Arc<dyn ChangeFeed>,
    ledger: Option<Arc<dyn Ledger>>,
    settings: RunnerSettings,
    commands: Receiver<Command>,
    notifications: Sender<Notification>,
    undelivered: VecDeque<Notification>,
    completions: (Sender<Completion>, Receiver<Completion>),
    pending: HashMap<u64, (Action, Responder)>,
    next_ticket: u64,
}

impl Runner {
    #[tracing::instrument(name = "session", skip_all, fields(user_id = %self.engine.user().id))]
    async fn run(mut self) {
        let mut events: Option<Receiver<ChangeEvent>> = None;
        let mut attempt = 0;
        let mut retry_at = Instant::now();

        loop {
            if events.is_none() && retry_at <= Instant::now() {
                match self.subscribe_and_resync().await {
                    Ok(receiver) => {
                        tracing::info!(attempt, "subscribed to change feed");
                        events = Some(receiver);
                        attempt = 0;
                    }
                    Err(err) => {
                        let delay = backoff(&self.settings, attempt);
                        tracing::warn!(%err, attempt, ?delay, "subscription failed, retrying");
                        retry_at = Instant::now() + delay;
                        attempt += 1;
                    }
                }
            }

            self.engine.tick(Utc::now());
            self.collect().await;

            let wake = self.wake_in(events.is_none().then(|| retry_at));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Ok(command) => self.handle(command).await,
                    Err(_) => {
                        tracing::info!("session handles dropped, stopping");
                        break;
                    }
                },
                event = next_event(events.as_ref()) => match event {
                    Ok(event) => self.engine.apply(event, Utc::now()),
                    Err(_) => {
                        tracing::warn!("change feed lost");
                        events = None;
                        retry_at = Instant::now();
                    }
                },
                sent = deliver(&self.notifications, self.undelivered.front()) => match sent {
                    Ok(()) => {
                        self.undelivered.pop_front();
                    }
                    Err(_) => self.undelivered.clear(),
                },
                Ok(completion) = self.completions.1.recv() => self.finish(completion),
                _ = tokio::time::sleep(wake) => {}
            }
        }
    }

    fn wake_in(&self, retry_at: Option<Instant>) -> Duration {
        let now = Utc::now();

        let deadline = self
            .engine
            .next_deadline()
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE);

        match retry_at {
            Some(retry_at) => deadline.min(retry_at.saturating_duration_since(Instant::now())),
            None => deadline,
        }
    }

    async fn subscribe_and_resync(&mut self) -> Result<Receiver<ChangeEvent>, Error> {
        // subscribe before reading so nothing between snapshot and feed is missed
        let events = self.feed.subscribe(self.settings.feed_capacity).await?;

        let categories = self.store.list_categories().await?;
        let active = self.store.find_active_ride(self.engine.user()).await?;
        let ended = match self.engine.stale_pointer(active.as_ref()) {
            Some(id) => Some((id, self.store.find_ride(id).await?)),
            None => None,
        };
        let pool = if self.engine.user().is_driver() {
            self.store.list_searching().await?
        } else {
            Vec::new()
        };

        self.engine.set_catalog(categories);
        self.refresh_balance().await;
        self.engine.resync(Snapshot { active, ended, pool }, Utc::now());

        Ok(events)
    }

    async fn refresh_balance(&mut self) {
        let ledger = match (&self.ledger, self.engine.user().is_rider()) {
            (Some(ledger), true) => ledger.clone(),
            _ => return,
        };

        match ledger.balance(self.engine.user().id).await {
            Ok(balance) => self.engine.set_balance(Some(balance)),
            Err(err) => {
                tracing::warn!(%err, "could not read wallet balance");
                self.engine.set_balance(None);
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        if let Command::Request { draft, .. } = &command {
            // the wallet may have been topped up since the last read
            if draft.payment_method == PaymentMethod::Wallet {
                self.refresh_balance().await;
            }
        }

        let now = Utc::now();

        match command {
            Command::Request { draft, reply } => match self.engine.prepare_request(draft, now) {
                Ok(Prepared::Submit(action)) => self.submit(action, Responder::Request(reply)),
                Ok(Prepared::Declined(outcome)) => {
                    let _ = reply.send(Ok(outcome));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Transition { id, trigger, reply } => {
                match self.engine.prepare_transition(id, trigger) {
                    Ok(action) => self.submit(action, Responder::Ride(reply)),
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Rate { id, rating, reply } => match self.engine.prepare_rating(id, rating) {
                Ok(action) => self.submit(action, Responder::Ride(reply)),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Reject { id, reply } => {
                let _ = reply.send(self.engine.reject_ride(id, now));
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.engine.clear_ride());
            }
            Command::ActiveRide { reply } => {
                let _ = reply.send(Ok(self.engine.active_ride().cloned()));
            }
            Command::Pool { reply } => {
                let _ = reply.send(Ok(self.engine.pool().snapshot()));
            }
            Command::CurrentOffer { reply } => {
                let _ = reply.send(Ok(self.engine.current_offer(now)));
            }
            Command::Quote {
                category_id,
                distance_km,
                reply,
            } => {
                let _ = reply.send(self.engine.quote(&category_id, distance_km));
            }
        }
    }

    fn submit(&mut self, action: Action, responder: Responder) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let store = self.store.clone();
        let completions = self.completions.0.clone();
        let task_action = action.clone();

        tokio::spawn(async move {
            let result = task_action.execute(store.as_ref()).await;
            let _ = completions.send(Completion { ticket, result }).await;
        });

        self.pending.insert(ticket, (action, responder));
    }

    fn finish(&mut self, completion: Completion) {
        let (action, responder) = match self.pending.remove(&completion.ticket) {
            Some(entry) => entry,
            None => return,
        };

        let result = self.engine.complete(&action, completion.result, Utc::now());

        match responder {
            Responder::Ride(reply) => {
                let _ = reply.send(result);
            }
            Responder::Request(reply) => {
                let _ = reply.send(result.map(|ride| RequestOutcome::Submitted { ride }));
            }
        }
    }

    /// Moves fresh notifications into the outgoing backlog.
    async fn collect(&mut self) {
        let mut completed = false;

        for notification in self.engine.drain_notifications() {
            completed |= notification.edge == Edge::Completed;

            if self.notifications.is_closed() {
                continue;
            }

            if self.undelivered.len() >= self.settings.notification_backlog.max(1) {
                if let Some(dropped) = self.undelivered.pop_front() {
                    tracing::warn!(ride_id = %dropped.ride_id, edge = ?dropped.edge, "notification backlog full, dropping oldest");
                }
            }

            self.undelivered.push_back(notification);
        }

        // a finished wallet trip has been charged
        if completed {
            self.refresh_balance().await;
        }
    }
}

async fn next_event(events: Option<&Receiver<ChangeEvent>>) -> Result<ChangeEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}

async fn deliver(
    sender: &Sender<Notification>,
    next: Option<&Notification>,
) -> Result<(), SendError<Notification>> {
    match next {
        Some(notification) => sender.send(notification.clone()).await,
        None => future::pending().await,
    }
}

fn backoff(settings: &RunnerSettings, attempt: u32) -> Duration {
    let exponential = settings
        .reconnect_base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(settings.reconnect_max);
    let jitter = rand::thread_rng().gen_range(0..=exponential.as_millis() as u64 / 2);

    exponential + Duration::from_millis(jitter)
}

/// A running session: the handle to drive it, the stream of notifications
/// it produces and the task running its dispatch loop.
pub struct Session {
    pub handle: SessionHandle,
    pub notifications: Receiver<Notification>,
    pub task: JoinHandle<()>,
}

impl Session {
    pub fn spawn(
        engine: Engine,
        store: Arc<dyn RideStore>,
        feed: Arc<dyn ChangeFeed>,
        ledger: Option<Arc<dyn Ledger>>,
        settings: RunnerSettings,
    ) -> Self {
        let (command_tx, command_rx) = async_channel::bounded(settings.command_capacity);
        let (notification_tx, notification_rx) =
            async_channel::bounded(settings.notification_capacity);

        let runner = Runner {
            engine,
            store,
            feed,
            ledger,
            settings,
            commands: command_rx,
            notifications: notification_tx,
            undelivered: VecDeque::new(),
            completions: async_channel::unbounded(),
            pending: HashMap::new(),
            next_ticket: 0,
        };

        Self {
            handle: SessionHandle {
                commands: command_tx,
            },
            notifications: notification_rx,
            task: tokio::spawn(runner.run()),
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
}

impl SessionHandle {
    async fn call<T, F>(&self, command: F) -> Result<T, Error>
    where
        T: Send,
        F: FnOnce(Reply<T>) -> Command + Send,
    {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(command(reply))
            .await
            .map_err(|_| network_error("session stopped"))?;

        response
            .await
            .map_err(|_| network_error("session stopped"))?
    }

    async fn transition(&self, id: Uuid, trigger: Trigger) -> Result<RideRequest, Error> {
        self.call(|reply| Command::Transition { id, trigger, reply })
            .await
    }
}

#[async_trait]
impl RideAPI for SessionHandle {
    async fn request_ride(&self, draft: RideDraft) -> Result<RequestOutcome, Error> {
        self.call(|reply| Command::Request { draft, reply }).await
    }

    async fn accept_ride(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.transition(id, Trigger::Accept).await
    }

    async fn reject_ride(&self, id: Uuid) -> Result<(), Error> {
        self.call(|reply| Command::Reject { id, reply }).await
    }

    async fn confirm_arrival(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.transition(id, Trigger::ConfirmArrival).await
    }

    async fn start_ride(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.transition(id, Trigger::Start).await
    }

    async fn finish_ride(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.transition(id, Trigger::Finish).await
    }

    async fn cancel_ride(&self, id: Uuid) -> Result<RideRequest, Error> {
        self.transition(id, Trigger::Cancel).await
    }

    async fn rate_ride(&self, id: Uuid, rating: Rating) -> Result<RideRequest, Error> {
        self.call(|reply| Command::Rate { id, rating, reply }).await
    }

    async fn clear_ride(&self) -> Result<(), Error> {
        self.call(|reply| Command::Clear { reply }).await
    }

    async fn active_ride(&self) -> Result<Option<RideRequest>, Error> {
        self.call(|reply| Command::ActiveRide { reply }).await
    }

    async fn pool(&self) -> Result<Vec<RideRequest>, Error> {
        self.call(|reply| Command::Pool { reply }).await
    }

    async fn current_offer(&self) -> Result<Option<Offer>, Error> {
        self.call(|reply| Command::CurrentOffer { reply }).await
    }

    async fn quote(&self, category_id: String, distance_km: f64) -> Result<f64, Error> {
        self.call(|reply| Command::Quote {
            category_id,
            distance_km,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::auth::User;
    use crate::engine::test_support::{draft, searching};
    use crate::engine::SessionConfig;
    use crate::entities::{Category, PaymentMethod, RideStatus};
    use crate::memory::{MemoryLedger, MemoryStore};

    fn settings() -> RunnerSettings {
        RunnerSettings {
            reconnect_base: Duration::from_millis(5),
            reconnect_max: Duration::from_millis(20),
            ..RunnerSettings::default()
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(vec![Category::metered(
            "standard", 5.0, 2.5, 8.0,
        )]))
    }

    fn session(user: User, store: &Arc<MemoryStore>, ledger: Option<Arc<MemoryLedger>>) -> Session {
        let engine = Engine::new(user, SessionConfig::default()).unwrap();

        Session::spawn(
            engine,
            store.clone(),
            store.clone(),
            ledger.map(|ledger| ledger as Arc<dyn Ledger>),
            settings(),
        )
    }

    /// Feed that refuses subscriptions until opened.
    struct GatedFeed {
        inner: Arc<MemoryStore>,
        open: AtomicBool,
    }

    #[async_trait]
    impl ChangeFeed for GatedFeed {
        async fn subscribe(&self, capacity: usize) -> Result<Receiver<ChangeEvent>, Error> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(network_error("feed unreachable"));
            }
            self.inner.subscribe(capacity).await
        }
    }

    async fn submitted(session: &Session, payment_method: PaymentMethod) -> RideRequest {
        match session
            .handle
            .request_ride(draft(payment_method, 2.0))
            .await
            .unwrap()
        {
            RequestOutcome::Submitted { ride } => ride,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    async fn next_edge(session: &Session) -> (Uuid, Edge) {
        let notification = tokio::time::timeout(Duration::from_secs(2), session.notifications.recv())
            .await
            .unwrap()
            .unwrap();

        (notification.ride_id, notification.edge)
    }

    #[tokio::test]
    async fn request_is_offered_accepted_and_followed() {
        let store = store();
        let rider = session(User::rider(Uuid::new_v4()), &store, None);
        let driver = session(User::driver(Uuid::new_v4()), &store, None);

        let ride = match rider
            .handle
            .request_ride(draft(PaymentMethod::Cash, 10.0))
            .await
            .unwrap()
        {
            RequestOutcome::Submitted { ride } => ride,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(ride.price, 30.0);

        assert_eq!(next_edge(&driver).await, (ride.id, Edge::Offered));

        let offer = driver.handle.current_offer().await.unwrap().unwrap();
        assert_eq!(offer.ride.id, ride.id);

        let accepted = driver.handle.accept_ride(ride.id).await.unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert!(driver.handle.pool().await.unwrap().is_empty());

        assert_eq!(next_edge(&rider).await, (ride.id, Edge::Accepted));
        assert_eq!(
            rider.handle.active_ride().await.unwrap().map(|r| r.status),
            Some(RideStatus::Accepted)
        );
    }

    #[tokio::test]
    async fn only_one_of_two_drivers_wins() {
        let store = store();
        let rider = session(User::rider(Uuid::new_v4()), &store, None);
        let first = session(User::driver(Uuid::new_v4()), &store, None);
        let second = session(User::driver(Uuid::new_v4()), &store, None);

        rider
            .handle
            .request_ride(draft(PaymentMethod::Cash, 3.0))
            .await
            .unwrap();
        let (ride_id, _) = next_edge(&first).await;
        next_edge(&second).await;

        let (a, b) = tokio::join!(first.handle.accept_ride(ride_id), second.handle.accept_ride(ride_id));

        assert!(a.is_ok() != b.is_ok());
        let loser = if a.is_ok() { &second } else { &first };
        assert!(loser.handle.pool().await.unwrap().is_empty());
        assert!(loser.handle.active_ride().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wallet_rider_is_told_what_is_missing() {
        let store = store();
        let rider_id = Uuid::new_v4();
        let ledger = Arc::new(MemoryLedger::default());
        ledger.set_balance(rider_id, 5.0).await;
        let rider = session(User::rider(rider_id), &store, Some(ledger));

        let outcome = rider
            .handle
            .request_ride(draft(PaymentMethod::Wallet, 1.0))
            .await
            .unwrap();

        assert_eq!(outcome, RequestOutcome::InsufficientFunds { missing_amount: 3.0 });
        assert!(rider.handle.active_ride().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn topped_up_wallet_is_seen_on_retry() {
        let store = store();
        let rider_id = Uuid::new_v4();
        let ledger = Arc::new(MemoryLedger::default());
        ledger.set_balance(rider_id, 5.0).await;
        let rider = session(User::rider(rider_id), &store, Some(ledger.clone()));

        let outcome = rider
            .handle
            .request_ride(draft(PaymentMethod::Wallet, 1.0))
            .await
            .unwrap();
        assert_eq!(outcome, RequestOutcome::InsufficientFunds { missing_amount: 3.0 });

        ledger.set_balance(rider_id, 100.0).await;

        let ride = match rider
            .handle
            .request_ride(draft(PaymentMethod::Wallet, 1.0))
            .await
            .unwrap()
        {
            RequestOutcome::Submitted { ride } => ride,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(ride.payment_method, PaymentMethod::Wallet);
    }

    #[tokio::test]
    async fn commands_are_answered_while_the_feed_is_down() {
        let store = store();
        let rider_id = Uuid::new_v4();
        let feed = Arc::new(GatedFeed {
            inner: store.clone(),
            open: AtomicBool::new(false),
        });
        let rider = Session::spawn(
            Engine::new(User::rider(rider_id), SessionConfig::default()).unwrap(),
            store.clone(),
            feed.clone(),
            None,
            settings(),
        );

        let active = tokio::time::timeout(Duration::from_millis(500), rider.handle.active_ride())
            .await
            .unwrap()
            .unwrap();
        assert!(active.is_none());

        let ride = searching(rider_id, Utc::now());
        store.put_ride(ride.clone()).await;
        feed.open.store(true, Ordering::SeqCst);

        eventually(|| async {
            rider.handle.active_ride().await.unwrap().map(|r| r.id) == Some(ride.id)
        })
        .await;
    }

    #[tokio::test]
    async fn notifications_wait_for_a_slow_receiver() {
        let store = store();
        let driver = Session::spawn(
            Engine::new(User::driver(Uuid::new_v4()), SessionConfig::default()).unwrap(),
            store.clone(),
            store.clone(),
            None,
            RunnerSettings {
                notification_capacity: 1,
                ..settings()
            },
        );

        let mut requested = Vec::new();
        for _ in 0..3 {
            let rider = session(User::rider(Uuid::new_v4()), &store, None);
            requested.push(submitted(&rider, PaymentMethod::Cash).await.id);
        }

        eventually(|| async { driver.handle.pool().await.unwrap().len() == 3 }).await;

        let mut offered = Vec::new();
        for _ in 0..3 {
            let (ride_id, edge) = next_edge(&driver).await;
            assert_eq!(edge, Edge::Offered);
            offered.push(ride_id);
        }

        requested.sort();
        offered.sort();
        assert_eq!(offered, requested);
    }

    #[tokio::test]
    async fn changes_missed_while_disconnected_are_recovered() {
        let store = store();
        let rider_id = Uuid::new_v4();
        let rider = session(User::rider(rider_id), &store, None);

        let ride = submitted(&rider, PaymentMethod::Cash).await;

        store.disconnect_all().await;
        let mut cancelled = ride.clone();
        cancelled.status = RideStatus::Cancelled;
        store.put_ride(cancelled).await;

        eventually(|| async {
            rider.handle.active_ride().await.unwrap().map(|r| r.status) == Some(RideStatus::Cancelled)
        })
        .await;

        assert_eq!(next_edge(&rider).await, (ride.id, Edge::Cancelled));
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_session() {
        let store = store();
        let Session { handle, task, .. } = session(User::driver(Uuid::new_v4()), &store, None);

        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let settings = RunnerSettings {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(1000),
            ..RunnerSettings::default()
        };

        let first = backoff(&settings, 0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let late = backoff(&settings, 30);
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1500));
    }
}
