use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{RequestOutcome, RideDraft};
use crate::entities::{Rating, RideRequest};
use crate::error::{insufficient_funds_error, Error};
use crate::server::DynAPI;

#[derive(Serialize, Deserialize)]
pub struct RateParams {
    stars: u8,
    comment: Option<String>,
}

/// Answers 402 with the missing amount when the wallet cannot cover the fare.
pub async fn create(
    Extension(api): Extension<DynAPI>,
    Json(draft): Json<RideDraft>,
) -> Result<(StatusCode, Json<RideRequest>), Error> {
    match api.request_ride(draft).await? {
        RequestOutcome::Submitted { ride } => Ok((StatusCode::CREATED, ride.into())),
        RequestOutcome::InsufficientFunds { missing_amount } => {
            Err(insufficient_funds_error(missing_amount))
        }
    }
}

pub async fn active(
    Extension(api): Extension<DynAPI>,
) -> Result<Json<Option<RideRequest>>, Error> {
    let ride = api.active_ride().await?;

    Ok(ride.into())
}

pub async fn clear(Extension(api): Extension<DynAPI>) -> Result<StatusCode, Error> {
    api.clear_ride().await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn accept(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, Error> {
    let ride = api.accept_ride(id).await?;

    Ok(ride.into())
}

pub async fn reject(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    api.reject_ride(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn arrive(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, Error> {
    let ride = api.confirm_arrival(id).await?;

    Ok(ride.into())
}

pub async fn start(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, Error> {
    let ride = api.start_ride(id).await?;

    Ok(ride.into())
}

pub async fn finish(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, Error> {
    let ride = api.finish_ride(id).await?;

    Ok(ride.into())
}

pub async fn cancel(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, Error> {
    let ride = api.cancel_ride(id).await?;

    Ok(ride.into())
}

pub async fn rate(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<RateParams>,
) -> Result<Json<RideRequest>, Error> {
    let rating = Rating::new(params.stars, params.comment)?;
    let ride = api.rate_ride(id, rating).await?;

    Ok(ride.into())
}
