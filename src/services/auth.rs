//! `/services/auth/`: hands out single-use WebSocket access tokens.
//!
//! Browsers cannot put credentials on an upgrade request, so a page first
//! fetches a token here with its credentials, then opens
//! `ws://host/...?accesstoken=<token>`. A token never buys another token.

use serde_json::json;

use crate::http::auth::Principal;
use crate::routing::{MethodSpec, Service, ServiceError};

pub const SIGNATURE: &str = "/services/auth/";

/// User recorded on tokens issued while authentication is off.
const ANONYMOUS: &str = "anonymous";

pub fn service() -> Service {
    Service::new(
        SIGNATURE,
        "auth",
        vec![MethodSpec::new("GetWebSocketToken", |ctx, _| {
            let auth = ctx.server.auth();
            if auth.enabled() && !ctx.principal.is_some_and(Principal::has_credentials) {
                return Err(ServiceError::Unauthorized("tokens are only issued against credentials".into()));
            }
            let user = ctx.user().unwrap_or(ANONYMOUS);
            let host = ctx.remote.map(|a| a.ip());
            Ok(Some(json!(auth.tokens().issue(user, host))))
        })
        .returns("token")],
    )
}
