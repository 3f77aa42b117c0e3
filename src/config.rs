use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::{
    auth::{Role, User},
    engine::{RunnerSettings, SessionConfig},
    error::{validation_error, Error},
};

/// Process configuration, read from the environment (and a `.env` file when
/// one is present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub listen_addr: SocketAddr,
    pub ledger_api_base: Option<String>,
    pub user: User,
    pub session: SessionConfig,
    pub runner: RunnerSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        dotenv::dotenv().ok();

        let user_id: Uuid = required("SESSION_USER_ID")?;
        let role: Role = required("SESSION_ROLE")?;
        let linger: i64 = optional("TERMINAL_LINGER_SECS", 15)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: optional("DATABASE_MAX_CONNECTIONS", 5)?,
            listen_addr: optional("LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            ledger_api_base: env::var("LEDGER_API_BASE").ok(),
            user: User { id: user_id, role },
            session: SessionConfig {
                offer_window: chrono::Duration::seconds(optional("OFFER_WINDOW_SECS", 60)?),
                rejection_cooldown: chrono::Duration::seconds(optional(
                    "REJECTION_COOLDOWN_SECS",
                    60,
                )?),
                terminal_linger: (linger > 0).then(|| chrono::Duration::seconds(linger)),
                retention: chrono::Duration::seconds(optional("RETENTION_SECS", 600)?),
            },
            runner: RunnerSettings {
                feed_capacity: optional("FEED_CAPACITY", 256)?,
                command_capacity: optional("COMMAND_CAPACITY", 64)?,
                notification_capacity: optional("NOTIFICATION_CAPACITY", 64)?,
                notification_backlog: optional("NOTIFICATION_BACKLOG", 1024)?,
                reconnect_base: Duration::from_millis(optional("RECONNECT_BASE_MS", 500)?),
                reconnect_max: Duration::from_millis(optional("RECONNECT_MAX_MS", 30_000)?),
            },
        })
    }
}

fn required<T: FromStr>(key: &str) -> Result<T, Error> {
    parse(key, &env::var(key)?)
}

fn optional<T: FromStr>(key: &str, default: T) -> Result<T, Error> {
    match env::var(key) {
        Ok(value) => parse(key, &value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| validation_error(format!("{} has an invalid value", key)))
}

#[test]
fn parses_values_and_reports_the_key() {
    assert_eq!(parse::<u32>("FEED_CAPACITY", " 12 ").unwrap(), 12);

    let err = parse::<u32>("FEED_CAPACITY", "many").unwrap_err();
    assert!(err.is_validation_error());
    assert!(err.message.contains("FEED_CAPACITY"));

    assert_eq!(parse::<Role>("SESSION_ROLE", "Driver").unwrap(), Role::Driver);
}

#[test]
fn missing_optional_values_fall_back() {
    assert_eq!(optional("CABALLUS_DISPATCH_UNSET_FOR_TEST", 7u64).unwrap(), 7);
}
