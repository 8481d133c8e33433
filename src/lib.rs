//! Game media import service
//!
//! Accepts batches of photos and videos attached to a game, stages them on
//! disk, and imports them asset by asset into object storage on a single
//! background worker. Clients poll task status while the import runs.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;

#[doc(hidden)]
pub mod test_support;
