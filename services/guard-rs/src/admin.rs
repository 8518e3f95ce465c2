//! Operator endpoints for the ban table.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Extension, Json, Router,
};
use serde_json::json;

use crate::pipeline::Defense;

/// Identity decoded by the upstream auth layer and attached as a request extension.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub user_id: String,
    pub role: String,
}

impl AuthIdentity {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

pub fn router(defense: Arc<Defense>) -> Router {
    Router::new()
        .route("/api/admin/security/bans", get(list_bans))
        .route("/api/admin/security/bans/:ip", delete(lift_ban))
        .route("/api/admin/security/stats", get(stats))
        .with_state(defense)
}

fn require_admin(identity: Option<Extension<AuthIdentity>>) -> Result<AuthIdentity, Response> {
    match identity {
        Some(Extension(identity)) if identity.is_admin() => Ok(identity),
        _ => Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Administrator access required" })),
        )
            .into_response()),
    }
}

async fn list_bans(
    State(defense): State<Arc<Defense>>,
    identity: Option<Extension<AuthIdentity>>,
) -> Response {
    if let Err(denied) = require_admin(identity) {
        return denied;
    }
    let mut bans = defense.state.active_bans();
    bans.sort_by(|a, b| b.banned_at.cmp(&a.banned_at));
    Json(json!({ "bans": bans })).into_response()
}

async fn lift_ban(
    State(defense): State<Arc<Defense>>,
    identity: Option<Extension<AuthIdentity>>,
    Path(ip): Path<String>,
) -> Response {
    let admin = match require_admin(identity) {
        Ok(admin) => admin,
        Err(denied) => return denied,
    };
    tracing::info!(ip = %ip, by = %admin.user_id, "unban requested");
    match defense.unban(&ip) {
        Some(lifted) => Json(json!({
            "unbanned": ip,
            "previous": lifted.ban,
            "offenses": lifted.offenses,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No ban or offense history for this address" })),
        )
            .into_response(),
    }
}

async fn stats(
    State(defense): State<Arc<Defense>>,
    identity: Option<Extension<AuthIdentity>>,
) -> Response {
    if let Err(denied) = require_admin(identity) {
        return denied;
    }
    Json(json!({
        "active_bans": defense.state.ban_count(),
        "offenders": defense.state.offender_count(),
        "global_windows": defense.state.global.len(),
        "auth_windows": defense.state.auth.len(),
        "tarpit_active": defense.tarpit.active(),
        "tarpit_capacity": defense.tarpit.capacity(),
    }))
    .into_response()
}
