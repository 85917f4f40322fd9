mod clock;
mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

pub use clock::{Clock, ManualClock, SystemClock};
pub use input_builder::{AdmissionInputBuilder, AdmissionInputFuture};
use std::future::Future;

use crate::policy::{PolicyName, RateLimitPolicy};
use crate::HeaderCompatibleOutput;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a request counter store and admission algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice.
pub trait Backend<I: 'static = AdmissionInput>: Clone {
    type Output;
    type Error;

    /// Process an incoming request.
    ///
    /// The input includes the identifier being counted and the policy to apply to it.
    ///
    /// Returns whether to allow or deny the request, along with output that can be used to
    /// describe the current limit state in the allowed and denied responses.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output), Self::Error>>;
}

/// A request to admit one call from `identifier` under `policy`.
#[derive(Debug, Clone)]
pub struct AdmissionInput {
    /// Counters are kept separately per policy.
    pub policy: PolicyName,
    /// The window and max requests to enforce.
    pub limit: RateLimitPolicy,
    /// Who is being counted, e.g. `user:abc123` or `ip:203.0.113.7`.
    pub identifier: String,
}

impl AdmissionInput {
    pub fn new(policy: PolicyName, limit: RateLimitPolicy, identifier: impl Into<String>) -> Self {
        Self {
            policy,
            limit,
            identifier: identifier.into(),
        }
    }
}

/// The limit state after an admission decision.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdmissionOutput {
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Length of the window.
    pub window: Duration,
    /// Number of requests that will be permitted until the limit resets.
    pub remaining: u64,
    /// Time at which the window resets, in milliseconds since the Unix epoch.
    pub reset_time: u64,
    /// The backend clock when the decision was made, in milliseconds since the Unix epoch.
    pub checked_at: u64,
}

/// Additional functions for a [Backend] that uses [AdmissionInput] and [AdmissionOutput].
pub trait CounterStore: Backend<AdmissionInput, Output = AdmissionOutput> {
    /// Removes the counter for an identifier under one policy, so that its next request
    /// starts a fresh window.
    fn remove_key(
        &self,
        policy: PolicyName,
        identifier: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Removes every counter whose window has already ended, returning how many were removed.
    fn cleanup(&self) -> impl Future<Output = Result<usize, Self::Error>>;
}

impl HeaderCompatibleOutput for AdmissionOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    fn reset_time_ms(&self) -> u64 {
        self.reset_time
    }

    fn checked_at_ms(&self) -> Option<u64> {
        Some(self.checked_at)
    }
}
