//! Request-defense layer for the storefront: honeypot paths, scanner
//! detection, fixed-window rate limits, escalating bans and a tarpit for
//! identities that are already banned.

pub mod admin;
pub mod config;
pub mod deception;
pub mod error;
pub mod escalation;
pub mod firewall;
pub mod honeypot;
pub mod identity;
pub mod middleware;
pub mod pipeline;
pub mod rate;
pub mod reaper;
pub mod report;
pub mod signatures;
pub mod state;
pub mod store;
pub mod tarpit;

use std::sync::Arc;

use axum::{middleware::from_fn_with_state, Router};

pub use admin::AuthIdentity;
pub use config::Config;
pub use pipeline::{Defense, RequestFacts, Verdict};

/// Mounts the admin routes next to `app` and puts the defense layer in front of both.
pub fn protect(app: Router, defense: Arc<Defense>) -> Router {
    app.merge(admin::router(Arc::clone(&defense)))
        .layer(from_fn_with_state(defense, middleware::guard))
}
