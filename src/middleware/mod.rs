//! Cross-cutting HTTP concerns that sit outside the auth layer: request
//! logging and per-IP rate limiting for the control-plane API.

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{RateLimitConfig, RateLimitLayer};
