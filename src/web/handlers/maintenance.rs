use salvo::prelude::*;

use super::{render_database_error, state_or_unavailable};

#[handler]
pub async fn recompute(res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };

    match state.maintenance.recompute().await {
        Ok(report) => res.render(Json(report)),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn refill_names(res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };

    match state.maintenance.refill_names().await {
        Ok(report) => res.render(Json(report)),
        Err(err) => render_database_error(res, err),
    }
}
