//! Remote server interaction: HTTP session, sync state, rate limiting.

mod client;
mod rate_limit;

pub use client::{
    AuthMode, FetchOutcome, ServerClient, ServerOptions, ServerStats, DEFAULT_CONVERGENCE_LIMIT,
    DEFAULT_CONVERGENCE_WINDOW,
};
pub use rate_limit::{RateLimiter, RateStats, DEFAULT_PER_MINUTE, DEFAULT_PER_TEN_MINUTES};
