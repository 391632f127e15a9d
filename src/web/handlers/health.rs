use salvo::prelude::*;
use serde_json::json;

use super::state_or_unavailable;

#[handler]
pub async fn health_check(res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };

    let (status, database) = match state.db.vote_store().count_votes().await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };

    res.status_code(status);
    res.render(Json(json!({
        "status": if status == StatusCode::OK { "ok" } else { "degraded" },
        "database": database,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    })));
}
