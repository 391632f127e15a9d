use chrono::Utc;
use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{id_param, limit_query, render_database_error, render_error, state_or_unavailable};

#[derive(Debug, Deserialize)]
struct OffsetRequest {
    delta: i64,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct SymbolsRequest {
    upvote: String,
    downvote: String,
}

#[handler]
pub async fn leaderboard(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let community_id = req.query::<i64>("community_id");
    let limit = limit_query(req);

    match state.queries.leaderboard(community_id, limit).await {
        Ok(entries) => res.render(Json(json!({
            "community_id": community_id,
            "entries": entries,
            "limit": limit,
        }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn user_summary(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.user_summary(user_id).await {
        Ok(summary) => res.render(Json(summary)),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn fans(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.fans_of(user_id, limit_query(req)).await {
        Ok(entries) => res.render(Json(json!({ "user_id": user_id, "fans": entries }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn haters(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.haters_of(user_id, limit_query(req)).await {
        Ok(entries) => res.render(Json(json!({ "user_id": user_id, "haters": entries }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn best_messages(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.best_messages_of(user_id, limit_query(req)).await {
        Ok(messages) => res.render(Json(json!({ "user_id": user_id, "messages": messages }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn worst_messages(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.worst_messages_of(user_id, limit_query(req)).await {
        Ok(messages) => res.render(Json(json!({ "user_id": user_id, "messages": messages }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn transactions(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };

    match state
        .db
        .user_store()
        .list_transactions(user_id, limit_query(req))
        .await
    {
        Ok(entries) => res.render(Json(json!({ "user_id": user_id, "transactions": entries }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn adjust_offset(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(user_id) = id_param(req, res, "id") else {
        return;
    };
    let body = match req.parse_json::<OffsetRequest>().await {
        Ok(body) => body,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid body: {}", err));
            return;
        }
    };
    let reason = body.reason.trim();
    if reason.is_empty() {
        render_error(res, StatusCode::BAD_REQUEST, "reason must not be empty");
        return;
    }

    match state
        .db
        .user_store()
        .adjust_offset(user_id, body.delta, reason)
        .await
    {
        Ok(score) => {
            info!(
                "offset adjusted via api user_id={} delta={} reason={}",
                user_id, body.delta, reason
            );
            res.render(Json(json!({
                "user_id": user_id,
                "delta": body.delta,
                "reason": reason,
                "score": score,
            })));
        }
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn top_messages(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let community_id = req.query::<i64>("community_id");
    let limit = limit_query(req);

    match state.queries.top_messages(community_id, limit).await {
        Ok(messages) => res.render(Json(json!({
            "community_id": community_id,
            "messages": messages,
        }))),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn message(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(message_id) = id_param(req, res, "id") else {
        return;
    };

    match state.db.message_store().get_message(message_id).await {
        Ok(Some(found)) => res.render(Json(found)),
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "message not found"),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn of_the_week(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(community_id) = id_param(req, res, "id") else {
        return;
    };

    match state.queries.of_the_week(community_id, Utc::now()).await {
        Ok(winners) => res.render(Json(winners)),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn get_symbols(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(community_id) = id_param(req, res, "id") else {
        return;
    };

    match state.db.settings_store().vote_symbols(community_id).await {
        Ok(symbols) => res.render(Json(symbols)),
        Err(err) => render_database_error(res, err),
    }
}

#[handler]
pub async fn put_symbols(req: &mut Request, res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    let Some(community_id) = id_param(req, res, "id") else {
        return;
    };
    let body = match req.parse_json::<SymbolsRequest>().await {
        Ok(body) => body,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid body: {}", err));
            return;
        }
    };
    if let Err(reason) = validate_symbols(&body.upvote, &body.downvote) {
        render_error(res, StatusCode::BAD_REQUEST, reason);
        return;
    }

    match state
        .db
        .settings_store()
        .set_vote_symbols(community_id, body.upvote.trim(), body.downvote.trim())
        .await
    {
        Ok(symbols) => {
            info!(
                "vote symbols changed community_id={} upvote={} downvote={}",
                community_id, symbols.upvote, symbols.downvote
            );
            res.render(Json(symbols));
        }
        Err(err) => render_database_error(res, err),
    }
}

fn validate_symbols(upvote: &str, downvote: &str) -> Result<(), &'static str> {
    let (upvote, downvote) = (upvote.trim(), downvote.trim());
    if upvote.is_empty() || downvote.is_empty() {
        return Err("symbols must not be empty");
    }
    if upvote == downvote {
        return Err("upvote and downvote symbols must differ");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::validate_symbols;

    #[test_case("👍", "👎", true ; "defaults")]
    #[test_case("⬆️", "⬇️", true ; "custom")]
    #[test_case(" ", "👎", false ; "blank upvote")]
    #[test_case("👍", " 👍 ", false ; "same symbol")]
    fn symbol_validation(upvote: &str, downvote: &str, ok: bool) {
        assert_eq!(validate_symbols(upvote, downvote).is_ok(), ok);
    }
}
