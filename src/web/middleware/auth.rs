use salvo::http::Method;
use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::web::handlers::{
    health::health_check,
    ledger::{
        adjust_offset, best_messages, fans, get_symbols, haters, leaderboard, message,
        of_the_week, put_symbols, top_messages, transactions, user_summary, worst_messages,
    },
    maintenance::{recompute, refill_names},
    render_error,
    scans::{cancel_scan, get_scan, list_scans, start_scan},
    state_or_unavailable,
};
use crate::web::metrics::metrics_endpoint;

/// Read-only methods pass; everything else needs `Authorization: Bearer <admin_token>`.
#[handler]
pub async fn require_admin(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    if matches!(*req.method(), Method::GET | Method::HEAD) {
        return;
    }
    let Some(state) = state_or_unavailable(res) else {
        ctrl.skip_rest();
        return;
    };

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !token_matches(state.admin_token.as_ref(), presented) {
        warn!("rejected operator request method={} path={}", req.method(), req.uri().path());
        render_error(res, StatusCode::UNAUTHORIZED, "missing or invalid admin token");
        ctrl.skip_rest();
    }
}

fn token_matches(expected: Option<&SecretString>, header: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let Some(presented) = header.and_then(|value| value.strip_prefix("Bearer ")) else {
        return false;
    };
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.trim().as_bytes();
    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }
    expected.ct_eq(presented).into()
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics_endpoint))
        .push(
            Router::with_path("api")
                .hoop(require_admin)
                .push(Router::with_path("leaderboard").get(leaderboard))
                .push(
                    Router::with_path("users/{id}")
                        .get(user_summary)
                        .push(Router::with_path("fans").get(fans))
                        .push(Router::with_path("haters").get(haters))
                        .push(Router::with_path("best").get(best_messages))
                        .push(Router::with_path("worst").get(worst_messages))
                        .push(Router::with_path("transactions").get(transactions))
                        .push(Router::with_path("offset").post(adjust_offset)),
                )
                .push(Router::with_path("messages/top").get(top_messages))
                .push(Router::with_path("messages/{id:num}").get(message))
                .push(
                    Router::with_path("communities/{id}")
                        .push(Router::with_path("week").get(of_the_week))
                        .push(
                            Router::with_path("symbols")
                                .get(get_symbols)
                                .put(put_symbols),
                        ),
                )
                .push(
                    Router::with_path("scans")
                        .get(list_scans)
                        .post(start_scan)
                        .push(
                            Router::with_path("{id}")
                                .get(get_scan)
                                .delete(cancel_scan),
                        ),
                )
                .push(
                    Router::with_path("maintenance")
                        .push(Router::with_path("recompute").post(recompute))
                        .push(Router::with_path("refill-names").post(refill_names)),
                ),
        )
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use test_case::test_case;

    use super::token_matches;

    #[test_case(Some("Bearer s3cret"), true ; "valid")]
    #[test_case(Some("Bearer wrong"), false ; "wrong token")]
    #[test_case(Some("Bearer s3cres"), false ; "same length different token")]
    #[test_case(Some("Bearer "), false ; "empty token")]
    #[test_case(Some("s3cret"), false ; "missing scheme")]
    #[test_case(Some("Basic s3cret"), false ; "other scheme")]
    #[test_case(None, false ; "no header")]
    fn bearer_token(header: Option<&str>, expected: bool) {
        let secret = SecretString::from("s3cret");
        assert_eq!(token_matches(Some(&secret), header), expected);
    }

    #[test]
    fn unset_token_rejects_everything() {
        assert!(!token_matches(None, Some("Bearer anything")));
    }

    #[test]
    fn empty_configured_token_rejects_everything() {
        let secret = SecretString::from("");
        assert!(!token_matches(Some(&secret), Some("Bearer ")));
    }
}
