//! Admission checks for handlers that pick their policy explicitly.

use crate::backend::{AdmissionInput, AdmissionOutput, Backend, CounterStore, Decision};
use crate::middleware::builder::rate_limited_response;
use crate::policy::{PolicyName, PolicySet};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for the {policy} policy")]
    RateLimited {
        policy: PolicyName,
        output: AdmissionOutput,
    },
    #[error("Rate limiter unavailable for the {policy} policy: {reason}")]
    Unavailable { policy: PolicyName, reason: String },
}

impl ResponseError for AdmissionError {
    fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AdmissionError::RateLimited { output, .. } => rate_limited_response(output),
            AdmissionError::Unavailable { .. } => HttpResponse::ServiceUnavailable().finish(),
        }
    }
}

/// Applies the [PolicySet] to identifiers through a [CounterStore].
///
/// The middleware covers the policy chosen by path; endpoints with stricter limits call
/// [admit](Self::admit) themselves before doing any work:
///
/// ```no_run
/// # use actix_web::{post, web, HttpRequest, HttpResponse};
/// # use draworld_admission::backend::memory::InMemoryBackend;
/// # use draworld_admission::identifier::IdentifierResolver;
/// # use draworld_admission::policy::PolicyName;
/// # use draworld_admission::{AdmissionController, AdmissionError};
/// #[post("/api/video/generate")]
/// async fn generate(
///     req: HttpRequest,
///     admission: web::Data<AdmissionController<InMemoryBackend>>,
/// ) -> Result<HttpResponse, AdmissionError> {
///     let identifier = IdentifierResolver::new().resolve(&req, None);
///     admission.admit(&identifier, PolicyName::VideoGeneration).await?;
///     Ok(HttpResponse::Accepted().finish())
/// }
/// ```
#[derive(Clone)]
pub struct AdmissionController<B> {
    backend: B,
    policies: Arc<PolicySet>,
}

impl<B> AdmissionController<B>
where
    B: CounterStore,
    B::Error: Display,
{
    pub fn new(backend: B, policies: PolicySet) -> Self {
        Self {
            backend,
            policies: Arc::new(policies),
        }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Count one request from `identifier` under `policy`.
    ///
    /// A denied request is a normal result, not an error; errors only come from the store.
    pub async fn is_allowed(
        &self,
        identifier: &str,
        policy: PolicyName,
    ) -> Result<(Decision, AdmissionOutput), B::Error> {
        debug_assert!(!identifier.is_empty(), "identifier must not be empty");
        let input = AdmissionInput::new(policy, *self.policies.get(policy), identifier);
        self.backend.request(input).await
    }

    /// Like [is_allowed](Self::is_allowed), but turns a denial into an [AdmissionError] that
    /// renders as the `429` response.
    ///
    /// When the store fails the policy's recommended fail mode applies: fail-open policies
    /// are admitted with no output, fail-closed ones are refused with
    /// [AdmissionError::Unavailable].
    pub async fn admit(
        &self,
        identifier: &str,
        policy: PolicyName,
    ) -> Result<Option<AdmissionOutput>, AdmissionError> {
        match self.is_allowed(identifier, policy).await {
            Ok((Decision::Allowed, output)) => Ok(Some(output)),
            Ok((Decision::Denied, output)) => {
                log::debug!("Rate limit exceeded for {identifier} under the {policy} policy");
                Err(AdmissionError::RateLimited { policy, output })
            }
            Err(e) if policy.recommended_fail_open() => {
                log::warn!("Rate limiter failed: {e}, allowing the request anyway");
                Ok(None)
            }
            Err(e) => {
                log::error!("Rate limiter failed: {e}");
                Err(AdmissionError::Unavailable {
                    policy,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Start a fresh window for `identifier`, e.g. when an admin lifts a block.
    pub async fn reset(&self, identifier: &str, policy: PolicyName) -> Result<(), B::Error> {
        self.backend.remove_key(policy, identifier).await
    }

    /// Remove counters whose window has ended.
    pub async fn cleanup(&self) -> Result<usize, B::Error> {
        self.backend.cleanup().await
    }
}
