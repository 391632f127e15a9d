use salvo::prelude::*;
use serde_json::json;

use crate::web::{WebState, web_state};

pub mod health;
pub mod ledger;
pub mod maintenance;
pub mod scans;

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

pub(crate) fn render_database_error(res: &mut Response, err: impl std::fmt::Display) {
    render_error(
        res,
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("database error: {}", err),
    );
}

pub(crate) fn state_or_unavailable(res: &mut Response) -> Option<&'static WebState> {
    let state = web_state();
    if state.is_none() {
        render_error(res, StatusCode::SERVICE_UNAVAILABLE, "service is starting");
    }
    state
}

pub(crate) fn id_param(req: &Request, res: &mut Response, name: &str) -> Option<i64> {
    match req.param::<i64>(name) {
        Some(v) if v > 0 => Some(v),
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid {}", name));
            None
        }
    }
}

pub(crate) fn limit_query(req: &Request) -> i64 {
    clamp_limit(req.query::<i64>("limit"))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}
