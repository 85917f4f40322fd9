mod config;
mod routes;

pub use config::ConfigError;
pub use routes::PolicyRouter;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
pub enum PolicyError {
    #[error("Rate limit window must be at least one millisecond")]
    ZeroWindow,
    #[error("Rate limit window must fit in 64 bits of milliseconds")]
    WindowTooLong,
    #[error("Rate limit max requests must be greater than zero")]
    ZeroMaxRequests,
}

/// A fixed window request limit.
///
/// Both values are validated on construction, so a policy in hand is always usable.
/// Counters work in whole milliseconds, so the window is kept at that precision.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct RateLimitPolicy {
    window_ms: u64,
    max_requests: u64,
}

impl RateLimitPolicy {
    /// Fails unless the window is between one millisecond and `u64::MAX` milliseconds and
    /// at least one request is allowed. Sub-millisecond parts of `window` are dropped.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self, PolicyError> {
        let window_ms =
            u64::try_from(window.as_millis()).map_err(|_| PolicyError::WindowTooLong)?;
        Self::from_millis(window_ms, max_requests)
    }

    pub fn from_millis(window_ms: u64, max_requests: u64) -> Result<Self, PolicyError> {
        if window_ms == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        if max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests);
        }
        Ok(Self {
            window_ms,
            max_requests,
        })
    }

    // Only for the built-in table, where the values are known to be non-zero.
    const fn fixed(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    /// The length of a single window, starting at the first request of an identifier.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// The total requests to be allowed within the window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

#[derive(Serialize, Deserialize)]
struct RawPolicy {
    window_ms: u64,
    max_requests: u64,
}

impl TryFrom<RawPolicy> for RateLimitPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        RateLimitPolicy::from_millis(raw.window_ms, raw.max_requests)
    }
}

impl From<RateLimitPolicy> for RawPolicy {
    fn from(policy: RateLimitPolicy) -> Self {
        RawPolicy {
            window_ms: policy.window_ms,
            max_requests: policy.max_requests,
        }
    }
}

/// The named limits of the Draworld API.
///
/// Each name is tracked independently, so one client can exhaust the authentication limit
/// and still be admitted under the general limit.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    VideoGeneration,
    ImageUpload,
    Authentication,
    Payment,
    General,
}

impl PolicyName {
    pub const ALL: [PolicyName; 5] = [
        PolicyName::VideoGeneration,
        PolicyName::ImageUpload,
        PolicyName::Authentication,
        PolicyName::Payment,
        PolicyName::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyName::VideoGeneration => "video_generation",
            PolicyName::ImageUpload => "image_upload",
            PolicyName::Authentication => "authentication",
            PolicyName::Payment => "payment",
            PolicyName::General => "general",
        }
    }

    /// Whether a request should be let through when the counter store is unavailable.
    ///
    /// Payment and authentication endpoints fail closed, everything else fails open.
    pub fn recommended_fail_open(self) -> bool {
        !matches!(self, PolicyName::Payment | PolicyName::Authentication)
    }

    fn index(self) -> usize {
        match self {
            PolicyName::VideoGeneration => 0,
            PolicyName::ImageUpload => 1,
            PolicyName::Authentication => 2,
            PolicyName::Payment => 3,
            PolicyName::General => 4,
        }
    }
}

impl Display for PolicyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One [RateLimitPolicy] for every [PolicyName], fixed for the lifetime of the process.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PolicySet {
    policies: [RateLimitPolicy; 5],
}

impl PolicySet {
    /// The production limits.
    pub fn draworld() -> Self {
        let mut policies = [RateLimitPolicy::fixed(HOUR_MS, 100); 5];
        policies[PolicyName::VideoGeneration.index()] = RateLimitPolicy::fixed(HOUR_MS, 5);
        policies[PolicyName::ImageUpload.index()] = RateLimitPolicy::fixed(HOUR_MS, 20);
        policies[PolicyName::Authentication.index()] =
            RateLimitPolicy::fixed(MINUTE_MS * 15, 10);
        policies[PolicyName::Payment.index()] = RateLimitPolicy::fixed(HOUR_MS, 5);
        policies[PolicyName::General.index()] = RateLimitPolicy::fixed(HOUR_MS, 100);
        Self { policies }
    }

    /// Replace the limit for a single policy.
    pub fn with_policy(mut self, name: PolicyName, policy: RateLimitPolicy) -> Self {
        self.policies[name.index()] = policy;
        self
    }

    pub fn get(&self, name: PolicyName) -> &RateLimitPolicy {
        &self.policies[name.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PolicyName, &RateLimitPolicy)> + '_ {
        PolicyName::ALL.iter().map(move |name| (*name, self.get(*name)))
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::draworld()
    }
}
