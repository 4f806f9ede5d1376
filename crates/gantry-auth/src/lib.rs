//! # Gantry Auth
//!
//! Identity and token layer of the gantry broker.
//!
//! Accepts bearer credentials that are either externally issued (RS256,
//! verified against a lazily cached JWKS) or internally issued (HS256 with
//! the `#RTC:` prefix, signed with the engine secret), and mints presigned
//! child tokens with scope narrowing.

pub mod error;
pub mod jwks;
pub mod token;

pub use error::{AuthError, AuthResult};
pub use jwks::{Jwk, JwksCache};
pub use token::{Auth, AuthConfig, INTERNAL_TOKEN_PREFIX, TokenConfig, simulate_user};
