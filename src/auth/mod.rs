//! Caller identity.
//!
//! Identity is established per request from one of three trust sources,
//! in strict priority:
//!
//! - **Signed-token assertion**: claims lifted from a verified identity-provider
//!   token by a trusted upstream, marked with `X-Auth-Source: entra-token`
//! - **Perimeter gateway**: identity headers set by the perimeter, trusted only
//!   when the deployment enables API gateway mode
//! - **Local token**: a bearer token validated against the shared secret (or
//!   an RS256 JWKS); headers sent next to it are trusted only after validation
//!
//! ## Security Model
//!
//! - Headers alone never establish identity
//! - A lower-priority source is never consulted once a higher one matched
//! - A missing signing secret disables bearer authentication instead of
//!   failing startup

mod identity;
pub mod jwks;
mod resolver;
mod user_directory;

pub use identity::{AuthMethod, Identity, Role};
pub use jwks::{JwksCache, JwksCacheError};
pub use resolver::{AuthConfig, AuthError, IdentityResolver};
pub use user_directory::{UserDirectory, UserStore};

