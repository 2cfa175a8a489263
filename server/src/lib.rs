//! AT Protocol OAuth sign-in for trainers.gg
//!
//! [`state::AppState`] wires the [`oauth::OAuthClient`] to storage and the user
//! directory; [`routes::routes`] exposes the client metadata, login, callback and
//! account-linking endpoints.

pub mod config;
pub mod cookies;
pub mod cron;
pub mod encryption;
pub mod errors;
pub mod oauth;
pub mod routes;
pub mod setup;
pub mod state;
pub mod storage;
pub mod user;

pub use cron::run_cron;
