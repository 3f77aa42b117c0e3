use axum::extract::{Extension, Json, Query};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::server::DynAPI;

#[derive(Serialize, Deserialize)]
pub struct QuoteParams {
    category_id: String,
    distance_km: f64,
}

#[derive(Serialize, Deserialize)]
pub struct Quote {
    category_id: String,
    distance_km: f64,
    price: f64,
}

pub async fn find(
    Extension(api): Extension<DynAPI>,
    Query(params): Query<QuoteParams>,
) -> Result<Json<Quote>, Error> {
    let price = api
        .quote(params.category_id.clone(), params.distance_km)
        .await?;

    Ok(Quote {
        category_id: params.category_id,
        distance_km: params.distance_km,
        price,
    }
    .into())
}
