use axum::extract::{Extension, Json};

use crate::engine::Offer;
use crate::entities::RideRequest;
use crate::error::Error;
use crate::server::DynAPI;

pub async fn pool(Extension(api): Extension<DynAPI>) -> Result<Json<Vec<RideRequest>>, Error> {
    let pool = api.pool().await?;

    Ok(pool.into())
}

pub async fn current(Extension(api): Extension<DynAPI>) -> Result<Json<Option<Offer>>, Error> {
    let offer = api.current_offer().await?;

    Ok(offer.into())
}
