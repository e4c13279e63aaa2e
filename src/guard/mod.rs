//! Request-side guards: address arithmetic, URL policy, rate limiting.

pub mod cidr;
pub mod rate_limit;
pub mod url;

pub use rate_limit::{RateLimitExceeded, RateLimiter};
pub use url::{BlockKind, UrlGatekeeper, UrlVerdict};
