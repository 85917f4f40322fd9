use crate::backend::{AdmissionInput, Backend, Clock, SystemClock};
use crate::middleware::{AllowedTransformation, DeniedResponse, FailOpen, RateLimiter};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_WINDOW: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-window"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct RateLimiterBuilder<BE, BI, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: Rc<FailOpen<BI>>,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BI, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: HeaderCompatibleOutput + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: Rc::new(|_: &BI| false),
            allowed_transformation: Some(Rc::new(|map: &mut HeaderMap, output: Option<&BO>| {
                if let Some(output) = output {
                    insert_all(map, rate_limit_headers(output));
                }
            })),
            denied_response: Rc::new(|output: &BO| rate_limited_response(output)),
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = Rc::new(move |_: &BI| fail_open);
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default the `x-ratelimit-*` headers from [rate_limit_headers] are added. Pass [None]
    /// to leave the response untouched.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and the request was let
    /// through because of [RateLimiterBuilder::fail_open].
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to [rate_limited_response].
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<BE, BI, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
        }
    }
}

impl<BE, BO, F> RateLimiterBuilder<BE, AdmissionInput, BO, F> {
    /// Decide whether to fail open per policy, using
    /// [PolicyName::recommended_fail_open](crate::policy::PolicyName::recommended_fail_open):
    /// payment and authentication requests are refused when the backend is unavailable,
    /// everything else is let through.
    pub fn policy_fail_mode(mut self) -> Self {
        self.fail_open = Rc::new(|input: &AdmissionInput| input.policy.recommended_fail_open());
        self
    }
}

/// A trait that a [Backend::Output] should implement in order to be described by the
/// `x-ratelimit-*` headers and the default denied response.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-window` header, sent in milliseconds.
    fn window(&self) -> Duration;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Time at which the limit resets, in milliseconds since the Unix epoch.
    fn reset_time_ms(&self) -> u64;

    /// Value for the `x-ratelimit-reset` header: the reset time in epoch seconds, rounded
    /// upwards, so that the limit is guaranteed to have reset at that second.
    fn reset_epoch_seconds(&self) -> u64 {
        self.reset_time_ms().div_ceil(1000)
    }

    /// The time the decision was made, on the same clock as
    /// [reset_time_ms](Self::reset_time_ms). `None` means the system clock is used.
    fn checked_at_ms(&self) -> Option<u64> {
        None
    }

    /// Value for the `retry-after` header, rounded upwards.
    ///
    /// If the limit has already reset this returns 0.
    fn seconds_until_reset(&self, now_ms: u64) -> u64 {
        self.reset_time_ms().saturating_sub(now_ms).div_ceil(1000)
    }
}

/// The informational rate limit headers for a response.
pub fn rate_limit_headers<O: HeaderCompatibleOutput + ?Sized>(output: &O) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit()));
    map.insert(
        X_RATELIMIT_WINDOW.clone(),
        HeaderValue::from(u64::try_from(output.window().as_millis()).unwrap_or(u64::MAX)),
    );
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(output.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(output.reset_epoch_seconds()),
    );
    map
}

pub(crate) fn insert_all(map: &mut HeaderMap, headers: HeaderMap) {
    for (name, value) in headers.iter() {
        map.insert(name.clone(), value.clone());
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody {
    error: &'static str,
    message: &'static str,
    reset_time: u64,
}

/// `429 Too Many Requests` with a JSON body and the rate limit headers, plus `retry-after`.
///
/// `retry-after` counts from [checked_at_ms](HeaderCompatibleOutput::checked_at_ms), so it
/// agrees with `x-ratelimit-reset` whichever clock the backend runs on.
///
/// ```json
/// {"error":"Too many requests","message":"Rate limit exceeded. Please try again later.","resetTime":1700000060000}
/// ```
pub fn rate_limited_response<O: HeaderCompatibleOutput + ?Sized>(output: &O) -> HttpResponse {
    let now_ms = output
        .checked_at_ms()
        .unwrap_or_else(|| SystemClock.now_ms());
    let mut response = HttpResponse::TooManyRequests().json(RateLimitedBody {
        error: "Too many requests",
        message: "Rate limit exceeded. Please try again later.",
        reset_time: output.reset_time_ms(),
    });
    let map = response.headers_mut();
    insert_all(map, rate_limit_headers(output));
    map.insert(
        RETRY_AFTER,
        HeaderValue::from(output.seconds_until_reset(now_ms)),
    );
    response
}
