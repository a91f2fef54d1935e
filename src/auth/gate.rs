//! Request authentication and capability checks
//!
//! A token can arrive in three places. They are tried in this order and the
//! first non-empty value wins; values are never combined:
//!
//! 1. `access_token` query parameter, read only by [`UpgradeTokenSources`]
//! 2. `Authorization: Bearer <token>` header
//! 3. the session cookie (name is configurable, default `lpm_token`)
//!
//! The query parameter exists because browsers cannot set headers on a
//! WebSocket upgrade. A token in a URL ends up in proxy and server access
//! logs, so plain REST routes extract [`TokenSources`] and never look at it.
//!
//! Every failure to authenticate is reported as [`GateError::Unauthenticated`]
//! no matter which check failed. The cause is only logged.

use crate::auth::claims::{CapabilitySet, Claims};
use crate::auth::tokens::TokenCodec;
use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, COOKIE, WWW_AUTHENTICATE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default session cookie name
pub const DEFAULT_COOKIE_NAME: &str = "lpm_token";

const BEARER_PREFIX: &str = "bearer ";

/// Externally visible gate outcomes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("invalid or expired token")]
    Unauthenticated,

    #[error("insufficient permissions for this operation")]
    Forbidden,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        match self {
            GateError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                [(WWW_AUTHENTICATE, "Bearer")],
                body,
            )
                .into_response(),
            GateError::Forbidden => (StatusCode::FORBIDDEN, body).into_response(),
        }
    }
}

/// Raw token candidates pulled from one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSources {
    pub explicit: Option<String>,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
}

impl TokenSources {
    /// Collect the header and cookie candidates
    pub fn from_headers(headers: &HeaderMap, cookie_name: &str) -> Self {
        let authorization = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let cookie = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|header| cookie_value(header, cookie_name));

        Self {
            explicit: None,
            authorization,
            cookie,
        }
    }

    /// Also accept an `access_token` query parameter from `uri`
    pub fn with_query_token(mut self, uri: &Uri) -> Self {
        self.explicit = Query::<TokenQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(params)| params.access_token);
        self
    }

    /// Apply the resolver chain
    pub fn resolve(&self) -> Option<&str> {
        TOKEN_RESOLVERS
            .iter()
            .find_map(|(_, resolver)| resolver(self))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

type Resolver = fn(&TokenSources) -> Option<&str>;

/// Token resolvers in precedence order
pub const TOKEN_RESOLVERS: [(&str, Resolver); 3] = [
    ("explicit", from_explicit),
    ("authorization", from_authorization_header),
    ("cookie", from_cookie),
];

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn from_explicit(sources: &TokenSources) -> Option<&str> {
    sources.explicit.as_deref().and_then(non_empty)
}

fn from_authorization_header(sources: &TokenSources) -> Option<&str> {
    let value = sources.authorization.as_deref()?.trim();
    let prefix = value.get(..BEARER_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        return None;
    }
    non_empty(&value[BEARER_PREFIX.len()..])
}

fn from_cookie(sources: &TokenSources) -> Option<&str> {
    sources.cookie.as_deref().and_then(non_empty)
}

/// Find one cookie in a `Cookie` header value
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Pick a token from the three transport locations
pub fn resolve_token(
    explicit: Option<&str>,
    authorization: Option<&str>,
    cookie: Option<&str>,
) -> Option<String> {
    let sources = TokenSources {
        explicit: explicit.map(str::to_string),
        authorization: authorization.map(str::to_string),
        cookie: cookie.map(str::to_string),
    };
    sources.resolve().map(str::to_string)
}

impl<S> FromRequestParts<S> for TokenSources
where
    Arc<AccessGate>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gate = Arc::<AccessGate>::from_ref(state);
        Ok(TokenSources::from_headers(&parts.headers, gate.cookie_name()))
    }
}

/// Token candidates for a WebSocket upgrade, query parameter included
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeTokenSources(pub TokenSources);

impl<S> FromRequestParts<S> for UpgradeTokenSources
where
    Arc<AccessGate>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gate = Arc::<AccessGate>::from_ref(state);
        Ok(UpgradeTokenSources(
            TokenSources::from_headers(&parts.headers, gate.cookie_name()).with_query_token(&parts.uri),
        ))
    }
}

/// Authenticates requests against the token codec
#[derive(Debug)]
pub struct AccessGate {
    codec: TokenCodec,
    cookie_name: String,
}

impl AccessGate {
    pub fn new(codec: TokenCodec, cookie_name: impl Into<String>) -> Self {
        Self {
            codec,
            cookie_name: cookie_name.into(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Resolve and verify the request's token
    pub fn authenticate(&self, sources: &TokenSources) -> Result<Claims, GateError> {
        let Some(token) = sources.resolve() else {
            debug!("no token presented");
            return Err(GateError::Unauthenticated);
        };

        self.codec.decode(token).map_err(|cause| {
            debug!(cause = %cause, "token rejected");
            GateError::Unauthenticated
        })
    }

    /// Build a reusable check for `capabilities`
    pub fn require(self: &Arc<Self>, capabilities: CapabilitySet) -> CapabilityGuard {
        CapabilityGuard {
            gate: self.clone(),
            required: capabilities,
        }
    }
}

/// Authenticate, then demand a set of capabilities
///
/// Used for both REST handlers and WebSocket admission.
#[derive(Debug, Clone)]
pub struct CapabilityGuard {
    gate: Arc<AccessGate>,
    required: CapabilitySet,
}

impl CapabilityGuard {
    pub fn required(&self) -> &CapabilitySet {
        &self.required
    }

    pub fn check(&self, sources: &TokenSources) -> Result<Claims, GateError> {
        let claims = self.gate.authenticate(sources)?;

        if !claims.has_all(&self.required) {
            debug!(
                subject_id = claims.subject_id,
                missing = ?self.required.missing_from(&claims.capabilities),
                "capability check failed"
            );
            return Err(GateError::Forbidden);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::{Algorithm, SigningKey};
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn gate() -> Arc<AccessGate> {
        let codec = TokenCodec::new(SigningKey::new(b"gate-test-secret".to_vec()), Algorithm::HS256);
        Arc::new(AccessGate::new(codec, DEFAULT_COOKIE_NAME))
    }

    fn token_for(gate: &AccessGate, permissions: &[&str]) -> String {
        let claims = Claims::new(3, "carla", permissions.iter().copied().collect());
        gate.codec().encode(&claims, Duration::from_secs(600)).unwrap()
    }

    fn bearer(token: &str) -> TokenSources {
        TokenSources {
            authorization: Some(format!("Bearer {}", token)),
            ..Default::default()
        }
    }

    #[test]
    fn test_header_beats_cookie() {
        let token = resolve_token(None, Some("Bearer abc"), Some("abc2"));
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_cookie_fallback() {
        assert_eq!(resolve_token(None, None, Some("abc2")).as_deref(), Some("abc2"));
    }

    #[test]
    fn test_explicit_beats_everything() {
        let token = resolve_token(Some("q"), Some("Bearer h"), Some("c"));
        assert_eq!(token.as_deref(), Some("q"));
    }

    #[test]
    fn test_bearer_prefix_case_insensitive_and_trimmed() {
        assert_eq!(resolve_token(None, Some("bearer   xyz  "), None).as_deref(), Some("xyz"));
        assert_eq!(resolve_token(None, Some("BEARER xyz"), None).as_deref(), Some("xyz"));
        assert_eq!(resolve_token(None, Some("  Bearer xyz"), None).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_non_bearer_header_ignored() {
        assert_eq!(resolve_token(None, Some("Basic dXNlcjpwdw=="), Some("c")).as_deref(), Some("c"));
        assert_eq!(resolve_token(None, Some("Bearerxyz"), None), None);
    }

    #[test]
    fn test_empty_sources_fall_through() {
        assert_eq!(resolve_token(Some(""), Some("Bearer   "), Some("c")).as_deref(), Some("c"));
        assert_eq!(resolve_token(Some("  "), None, Some("")), None);
        assert_eq!(resolve_token(None, None, None), None);
    }

    #[test]
    fn test_resolver_order_is_fixed() {
        let names: Vec<&str> = TOKEN_RESOLVERS.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["explicit", "authorization", "cookie"]);
    }

    #[test]
    fn test_sources_from_request() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; lpm_token=from-cookie; other=1"),
        );

        let uri: Uri = "/ws?foo=1&access_token=from-query".parse().unwrap();
        let sources = TokenSources::from_headers(&headers, "lpm_token").with_query_token(&uri);
        assert_eq!(sources.explicit.as_deref(), Some("from-query"));
        assert_eq!(sources.authorization.as_deref(), Some("Bearer from-header"));
        assert_eq!(sources.cookie.as_deref(), Some("from-cookie"));
        assert_eq!(sources.resolve(), Some("from-query"));
    }

    #[test]
    fn test_custom_cookie_name() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("lpm_token=a; session=b"));

        let sources = TokenSources::from_headers(&headers, "session");
        assert_eq!(sources.resolve(), Some("b"));
    }

    #[tokio::test]
    async fn test_query_token_only_on_upgrade() {
        let gate = gate();
        let request = axum::http::Request::builder()
            .uri("/api/me?access_token=from-query")
            .header(AUTHORIZATION, "Bearer from-header")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let plain = TokenSources::from_request_parts(&mut parts, &gate).await.unwrap();
        assert_eq!(plain.explicit, None);
        assert_eq!(plain.resolve(), Some("from-header"));

        let UpgradeTokenSources(upgrade) =
            UpgradeTokenSources::from_request_parts(&mut parts, &gate).await.unwrap();
        assert_eq!(upgrade.resolve(), Some("from-query"));
    }

    #[test]
    fn test_authenticate() {
        let gate = gate();
        let token = token_for(&gate, &["cases:read"]);

        let claims = gate.authenticate(&bearer(&token)).unwrap();
        assert_eq!(claims.username, "carla");
        assert_eq!(claims.subject_id, 3);
    }

    #[test]
    fn test_authenticate_failures_collapse() {
        let gate = gate();

        assert_eq!(
            gate.authenticate(&TokenSources::default()),
            Err(GateError::Unauthenticated)
        );
        assert_eq!(
            gate.authenticate(&bearer("garbage")),
            Err(GateError::Unauthenticated)
        );

        let foreign = TokenCodec::new(SigningKey::new(b"other".to_vec()), Algorithm::HS256)
            .encode(&Claims::new(1, "x", CapabilitySet::new()), Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            gate.authenticate(&bearer(&foreign)),
            Err(GateError::Unauthenticated)
        );
    }

    #[test]
    fn test_bad_explicit_token_does_not_fall_back() {
        let gate = gate();
        let good = token_for(&gate, &[]);
        let sources = TokenSources {
            explicit: Some("stale".to_string()),
            authorization: Some(format!("Bearer {}", good)),
            cookie: None,
        };

        assert_eq!(gate.authenticate(&sources), Err(GateError::Unauthenticated));
    }

    #[test]
    fn test_require_subset() {
        let gate = gate();
        let guard = gate.require(["x"].into_iter().collect());

        let only_y = token_for(&gate, &["y"]);
        assert_eq!(guard.check(&bearer(&only_y)), Err(GateError::Forbidden));

        let x_and_y = token_for(&gate, &["x", "y"]);
        assert!(guard.check(&bearer(&x_and_y)).is_ok());

        let just_x = token_for(&gate, &["x"]);
        assert!(guard.check(&bearer(&just_x)).is_ok());
    }

    #[test]
    fn test_require_authenticates_first() {
        let gate = gate();
        let guard = gate.require(["x"].into_iter().collect());

        assert_eq!(
            guard.check(&TokenSources::default()),
            Err(GateError::Unauthenticated)
        );
    }

    #[test]
    fn test_empty_requirement_admits_any_principal() {
        let gate = gate();
        let guard = gate.require(CapabilitySet::new());
        let token = token_for(&gate, &[]);

        assert!(guard.check(&bearer(&token)).is_ok());
    }

    #[test]
    fn test_rejection_status_codes() {
        let unauth = GateError::Unauthenticated.into_response();
        assert_eq!(unauth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unauth.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");

        let forbidden = GateError::Forbidden.into_response();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }
}
