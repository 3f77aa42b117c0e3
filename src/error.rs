use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use std::fmt::{self, Debug, Display};

#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

const UNEXPECTED: i32 = 0;
const ENV_VAR: i32 = 1;
const DATABASE: i32 = 2;
const UPSTREAM: i32 = 3;
const NETWORK: i32 = 4;
const AUTHORIZOR: i32 = 5;
const INVALID_TRANSITION: i32 = 100;
const VALIDATION: i32 = 101;
const CONFLICT: i32 = 102;
const UNAUTHORIZED: i32 = 103;
const INSUFFICIENT_FUNDS: i32 = 104;
const NOT_FOUND: i32 = 105;

impl Error {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_invalid_transition_error(&self) -> bool {
        self.code == INVALID_TRANSITION
    }

    pub fn is_validation_error(&self) -> bool {
        self.code == VALIDATION
    }

    pub fn is_conflict_error(&self) -> bool {
        self.code == CONFLICT
    }

    pub fn is_unauthorized_error(&self) -> bool {
        self.code == UNAUTHORIZED
    }

    pub fn is_insufficient_funds_error(&self) -> bool {
        self.code == INSUFFICIENT_FUNDS
    }

    pub fn is_not_found_error(&self) -> bool {
        self.code == NOT_FOUND
    }

    pub fn is_network_error(&self) -> bool {
        self.code == NETWORK
    }
}

pub fn invalid_transition_error() -> Error {
    Error::new(INVALID_TRANSITION, "invalid transition")
}

pub fn validation_error(message: impl Into<String>) -> Error {
    Error::new(VALIDATION, message)
}

pub fn conflict_error() -> Error {
    Error::new(CONFLICT, "conflict")
}

/// An action whose result arrived after a more recent authoritative change.
pub fn superseded_error() -> Error {
    Error::new(CONFLICT, "superseded by a more recent change")
}

pub fn unauthorized_error() -> Error {
    Error::new(UNAUTHORIZED, "unauthorized")
}

pub fn insufficient_funds_error(missing_amount: f64) -> Error {
    Error::new(
        INSUFFICIENT_FUNDS,
        format!("insufficient funds, missing {:.2}", missing_amount),
    )
}

pub fn not_found_error() -> Error {
    Error::new(NOT_FOUND, "not found")
}

pub fn network_error(message: impl Into<String>) -> Error {
    Error::new(NETWORK, message)
}

pub fn database_error<T: Debug>(err: T) -> Error {
    tracing::error!(error = ?err, "database error");
    Error::new(DATABASE, "database error")
}

pub fn upstream_error() -> Error {
    Error::new(UPSTREAM, "upstream error")
}

pub fn unexpected_error() -> Error {
    Error::new(UNEXPECTED, "unexpected error")
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

impl From<env::VarError> for Error {
    fn from(_: env::VarError) -> Self {
        Self::new(ENV_VAR, "environment variable error")
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => not_found_error(),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                network_error("database connection lost")
            }
            err => database_error(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return network_error("upstream unreachable");
        }

        upstream_error()
    }
}

impl From<oso::OsoError> for Error {
    fn from(err: oso::OsoError) -> Self {
        tracing::error!(error = %err, "authorizor error");
        Self::new(AUTHORIZOR, "authorizor error")
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        upstream_error()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.code {
            NETWORK => (StatusCode::SERVICE_UNAVAILABLE, self.message.as_str()),
            0..=99 => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            UNAUTHORIZED => (StatusCode::FORBIDDEN, self.message.as_str()),
            CONFLICT => (StatusCode::CONFLICT, self.message.as_str()),
            INSUFFICIENT_FUNDS => (StatusCode::PAYMENT_REQUIRED, self.message.as_str()),
            NOT_FOUND => (StatusCode::NOT_FOUND, self.message.as_str()),
            _ => (StatusCode::BAD_REQUEST, self.message.as_str()),
        };

        let body = Json(json!({
            "code": self.code,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[test]
fn caller_errors_are_not_internal() {
    let response = conflict_error().into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = network_error("feed closed").into_response();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = unexpected_error().into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = invalid_transition_error().into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn superseded_is_a_conflict() {
    assert!(superseded_error().is_conflict_error());
    assert!(insufficient_funds_error(3.0)
        .message
        .contains("3.00"));
}
