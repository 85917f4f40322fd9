#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
mod controller;
pub mod identifier;
mod middleware;
pub mod policy;

pub use controller::{AdmissionController, AdmissionError};
pub use middleware::builder::{
    rate_limit_headers, rate_limited_response, HeaderCompatibleOutput, RateLimiterBuilder,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATELIMIT_WINDOW,
};
pub use middleware::{RateLimiter, RateLimiterMiddleware};
