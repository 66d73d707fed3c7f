#![deny(clippy::all)]

pub mod config;
pub mod dimse;
pub mod dispatch;
pub mod mpps;
pub mod notification;
pub mod notify;
pub mod security;
pub mod server;
pub mod store;
pub mod uid;
