use async_channel::Receiver;
use async_trait::async_trait;
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgRow},
    types::Json,
    Executor, Pool, Postgres, Row,
};
use uuid::Uuid;

use crate::{
    api::{ChangeEvent, ChangeFeed, RideStore, UpdateOutcome},
    auth::User,
    entities::{Category, Change, Place, Pricing, Precondition, Rating, RideRequest},
    error::{conflict_error, invalid_transition_error, not_found_error, Error},
};

const CHANNEL: &str = "ride_requests";

const UNIQUE_VIOLATION: &str = "23505";

const RIDE_COLUMNS: &str = "id, customer_id, driver_id, pickup, destination, category_id, payment_method, distance_km, price, status, created_at, rating";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    #[tracing::instrument(skip(db_uri))]
    pub async fn new(db_uri: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_uri)
            .await?;

        // TODO: move this to migrations
        pool.execute("CREATE TABLE IF NOT EXISTS categories (id VARCHAR PRIMARY KEY, name VARCHAR NOT NULL, pricing jsonb NOT NULL)")
            .await?;
        pool.execute("CREATE TABLE IF NOT EXISTS ride_requests (id UUID PRIMARY KEY, customer_id UUID NOT NULL, driver_id UUID, pickup jsonb NOT NULL, destination jsonb NOT NULL, category_id VARCHAR NOT NULL REFERENCES categories(id), payment_method VARCHAR NOT NULL, distance_km FLOAT8 NOT NULL, price FLOAT8 NOT NULL, status VARCHAR NOT NULL, created_at TIMESTAMPTZ NOT NULL, rating jsonb)")
            .await?;
        // one open ride per rider and per driver
        pool.execute("CREATE UNIQUE INDEX IF NOT EXISTS ride_requests_open_customer ON ride_requests (customer_id) WHERE status NOT IN ('COMPLETED', 'CANCELLED')")
            .await?;
        pool.execute("CREATE UNIQUE INDEX IF NOT EXISTS ride_requests_open_driver ON ride_requests (driver_id) WHERE driver_id IS NOT NULL AND status NOT IN ('COMPLETED', 'CANCELLED')")
            .await?;
        pool.execute("CREATE INDEX IF NOT EXISTS ride_requests_searching ON ride_requests (created_at, id) WHERE status = 'SEARCHING'")
            .await?;
        pool.execute(
            "CREATE OR REPLACE FUNCTION notify_ride_requests() RETURNS trigger AS $$
            DECLARE
                changed ride_requests;
            BEGIN
                IF TG_OP = 'DELETE' THEN
                    changed := OLD;
                ELSE
                    changed := NEW;
                END IF;
                PERFORM pg_notify('ride_requests', json_build_object('event_type', TG_OP, 'row', row_to_json(changed))::text);
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql",
        )
        .await?;
        pool.execute("DROP TRIGGER IF EXISTS ride_requests_notify ON ride_requests")
            .await?;
        pool.execute("CREATE TRIGGER ride_requests_notify AFTER INSERT OR UPDATE OR DELETE ON ride_requests FOR EACH ROW EXECUTE FUNCTION notify_ride_requests()")
            .await?;

        Ok(Self { pool })
    }

    pub async fn upsert_category(&self, category: &Category) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query("INSERT INTO categories (id, name, pricing) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, pricing = EXCLUDED.pricing")
                .bind(&category.id)
                .bind(&category.name)
                .bind(Json(&category.pricing)),
        )
        .await?;

        Ok(())
    }
}

fn ride_from_row(row: &PgRow) -> Result<RideRequest, Error> {
    let pickup: Json<Place> = row.try_get("pickup")?;
    let destination: Json<Place> = row.try_get("destination")?;
    let payment_method: String = row.try_get("payment_method")?;
    let status: String = row.try_get("status")?;
    let rating: Option<Json<Rating>> = row.try_get("rating")?;

    Ok(RideRequest {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        driver_id: row.try_get("driver_id")?,
        pickup: pickup.0,
        destination: destination.0,
        category_id: row.try_get("category_id")?,
        payment_method: payment_method.parse()?,
        distance_km: row.try_get("distance_km")?,
        price: row.try_get("price")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        rating: rating.map(|rating| rating.0),
    })
}

/// Unique index violations are the database refusing a second open ride.
fn write_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return conflict_error();
        }
    }

    err.into()
}

#[async_trait]
impl RideStore for PgStore {
    #[tracing::instrument(skip(self, ride), fields(ride_id = %ride.id))]
    async fn insert_ride(&self, ride: RideRequest) -> Result<RideRequest, Error> {
        let mut conn = self.pool.acquire().await?;

        let query = format!("INSERT INTO ride_requests ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING {cols}", cols = RIDE_COLUMNS);

        let row = conn
            .fetch_one(
                sqlx::query(&query)
                    .bind(ride.id)
                    .bind(ride.customer_id)
                    .bind(ride.driver_id)
                    .bind(Json(&ride.pickup))
                    .bind(Json(&ride.destination))
                    .bind(&ride.category_id)
                    .bind(ride.payment_method.name())
                    .bind(ride.distance_km)
                    .bind(ride.price)
                    .bind(ride.status.name())
                    .bind(ride.created_at)
                    .bind(ride.rating.as_ref().map(Json)),
            )
            .await
            .map_err(write_error)?;

        ride_from_row(&row)
    }

    #[tracing::instrument(skip(self, precondition, change))]
    async fn update_ride(
        &self,
        id: Uuid,
        precondition: Precondition,
        change: Change,
    ) -> Result<UpdateOutcome, Error> {
        if change.status != precondition.status
            && !precondition.status.can_transition_to(change.status)
        {
            return Err(invalid_transition_error());
        }

        let mut conn = self.pool.acquire().await?;

        let query = format!(
            "UPDATE ride_requests SET status = $2, driver_id = COALESCE($3, driver_id), rating = COALESCE($4, rating) \
             WHERE id = $1 AND status = $5 AND driver_id IS NOT DISTINCT FROM $6 AND (NOT $7 OR rating IS NULL) \
             RETURNING {}",
            RIDE_COLUMNS
        );

        let updated = conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(id)
                    .bind(change.status.name())
                    .bind(change.driver_id)
                    .bind(change.rating.as_ref().map(Json))
                    .bind(precondition.status.name())
                    .bind(precondition.driver_id)
                    .bind(precondition.unrated),
            )
            .await
            .map_err(write_error)?;

        if let Some(row) = updated {
            return Ok(UpdateOutcome::Applied(ride_from_row(&row)?));
        }

        match self.find_ride(id).await? {
            Some(current) => {
                tracing::info!(status = %current.status, "precondition no longer holds");
                Ok(UpdateOutcome::Conflict(Some(current)))
            }
            None => Err(not_found_error()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn find_ride(&self, id: Uuid) -> Result<Option<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let query = format!("SELECT {} FROM ride_requests WHERE id = $1", RIDE_COLUMNS);

        conn.fetch_optional(sqlx::query(&query).bind(id))
            .await?
            .as_ref()
            .map(ride_from_row)
            .transpose()
    }

    #[tracing::instrument(skip(self, user), fields(user_id = %user.id))]
    async fn find_active_ride(&self, user: &User) -> Result<Option<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let query = format!(
            "SELECT {} FROM ride_requests WHERE (customer_id = $1 OR driver_id = $1) AND status NOT IN ('COMPLETED', 'CANCELLED') ORDER BY created_at DESC LIMIT 1",
            RIDE_COLUMNS
        );

        conn.fetch_optional(sqlx::query(&query).bind(user.id))
            .await?
            .as_ref()
            .map(ride_from_row)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn list_searching(&self) -> Result<Vec<RideRequest>, Error> {
        let mut conn = self.pool.acquire().await?;

        let query = format!(
            "SELECT {} FROM ride_requests WHERE status = 'SEARCHING' ORDER BY created_at, id",
            RIDE_COLUMNS
        );

        conn.fetch_all(sqlx::query(&query))
            .await?
            .iter()
            .map(ride_from_row)
            .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn list_categories(&self) -> Result<Vec<Category>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query("SELECT id, name, pricing FROM categories"))
            .await?;

        rows.iter()
            .map(|row| {
                let pricing: Json<Pricing> = row.try_get("pricing")?;

                Ok(Category {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    pricing: pricing.0,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for PgStore {
    #[tracing::instrument(skip(self))]
    async fn subscribe(&self, capacity: usize) -> Result<Receiver<ChangeEvent>, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;

        let (sender, receiver) = async_channel::bounded(capacity.max(1));

        tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                            Ok(event) => event,
                            Err(err) => {
                                tracing::warn!(%err, "undecodable change notification");
                                continue;
                            }
                        };

                        // a full buffer or a dropped receiver ends the subscription
                        if sender.try_send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("listener connection lost");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "listener failed");
                        break;
                    }
                }
            }

            sender.close();
        });

        Ok(receiver)
    }
}
