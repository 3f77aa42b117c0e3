pub mod api;
pub mod auth;
pub mod balance;
pub mod config;
pub mod db;
pub mod engine;
pub mod entities;
pub mod error;
pub mod external;
pub mod fare;
pub mod memory;
pub mod server;

pub mod simulation;
