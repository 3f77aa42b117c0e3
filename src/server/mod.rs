mod handlers;

use std::net::SocketAddr;

use axum::{
    extract::Extension,
    routing::{get, patch, post},
    Router,
};

use crate::api::DynRideAPI as DynAPI;
use crate::error::{network_error, Error};
use crate::server::handlers::{offers, quotes, rides};

pub fn router(api: DynAPI) -> Router {
    Router::new()
        .route("/rides", post(rides::create))
        .route("/rides/active", get(rides::active).delete(rides::clear))
        .route("/rides/:id/accept", patch(rides::accept))
        .route("/rides/:id/reject", patch(rides::reject))
        .route("/rides/:id/arrive", patch(rides::arrive))
        .route("/rides/:id/start", patch(rides::start))
        .route("/rides/:id/finish", patch(rides::finish))
        .route("/rides/:id/cancel", patch(rides::cancel))
        .route("/rides/:id/rate", patch(rides::rate))
        .route("/pool", get(offers::pool))
        .route("/offer", get(offers::current))
        .route("/quote", get(quotes::find))
        .layer(Extension(api))
}

pub async fn serve(api: DynAPI, addr: SocketAddr) -> Result<(), Error> {
    let app = router(api);

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| network_error(err.to_string()))
}
