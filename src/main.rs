use std::sync::Arc;

use dispatch::api::{DynRideAPI, Ledger};
use dispatch::config::Config;
use dispatch::db::PgStore;
use dispatch::engine::{Engine, Session};
use dispatch::error::Error;
use dispatch::external::ledger::HttpLedger;
use dispatch::server::serve;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let store = Arc::new(PgStore::new(&config.database_url, config.database_max_connections).await?);
    let ledger = config
        .ledger_api_base
        .as_ref()
        .map(|base| Arc::new(HttpLedger::new(base.as_str())) as Arc<dyn Ledger>);

    let engine = Engine::new(config.user.clone(), config.session.clone())?;
    let session = Session::spawn(engine, store.clone(), store, ledger, config.runner.clone());

    let notifications = session.notifications.clone();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            tracing::info!(ride_id = %notification.ride_id, edge = ?notification.edge, "notification");
        }
    });

    serve(Arc::new(session.handle) as DynRideAPI, config.listen_addr).await
}
