use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{render_error, state_or_unavailable};
use crate::ledger::{ScanMode, ScanTarget};

#[derive(Debug, Deserialize)]
struct StartScanRequest {
    target: ScanTarget,
    #[serde(default = "default_mode")]
    mode: ScanMode,
}

fn default_mode() -> ScanMode {
    ScanMode::Resume
}

fn job_id(req: &Request, res: &mut Response) -> Option<Uuid> {
    let parsed = req
        .param::<String>("id")
        .and_then(|raw| Uuid::parse_str(&raw).ok());
    if parsed.is_none() {
        render_error(res, StatusCode::BAD_REQUEST, "invalid scan id");
    }
    parsed
}

#[handler]
pub async fn start_scan(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let body = match req.parse_json::<StartScanRequest>().await {
        Ok(body) => body,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid body: {}", err));
            return;
        }
    };

    let job = state
        .registry
        .start(state.scanner.clone(), body.target, body.mode);
    res.status_code(StatusCode::ACCEPTED);
    res.render(Json(job));
}

#[handler]
pub async fn list_scans(res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let jobs = state.registry.list();
    res.render(Json(json!({ "count": jobs.len(), "jobs": jobs })));
}

#[handler]
pub async fn get_scan(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(id) = job_id(req, res) else {
        return;
    };

    match state.registry.get(&id) {
        Some(job) => res.render(Json(job)),
        None => render_error(res, StatusCode::NOT_FOUND, "scan not found"),
    }
}

#[handler]
pub async fn cancel_scan(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(id) = job_id(req, res) else {
        return;
    };

    if state.registry.cancel(&id) {
        res.status_code(StatusCode::ACCEPTED);
        res.render(Json(json!({ "ok": true, "id": id })));
    } else if state.registry.get(&id).is_some() {
        render_error(res, StatusCode::CONFLICT, "scan is not running");
    } else {
        render_error(res, StatusCode::NOT_FOUND, "scan not found");
    }
}
