//! Authentication and authorization
//!
//! - `tokens`: signed, stateless access tokens (HMAC JWT)
//! - `claims`: the identity and capability set a token carries
//! - `gate`: token resolution from requests and capability checks
//!
//! Capabilities are plain strings handed out by the auth service at login,
//! e.g. `cases:read` or `manage_users`.

mod claims;
mod gate;
mod tokens;

pub use claims::{CapabilitySet, Claims};
pub use gate::{
    resolve_token, AccessGate, CapabilityGuard, GateError, TokenSources, UpgradeTokenSources,
    DEFAULT_COOKIE_NAME, TOKEN_RESOLVERS,
};
pub use tokens::{
    Algorithm, AuthError, Clock, DecodedToken, SigningKey, SystemClock, TokenCodec, TokenError,
};
