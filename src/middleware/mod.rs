pub mod builder;

use crate::backend::Backend;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::HttpResponse;
use builder::{HeaderCompatibleOutput, RateLimiterBuilder};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation<BO> = dyn Fn(&mut HeaderMap, Option<&BO>);
type DeniedResponse<BO> = dyn Fn(&BO) -> HttpResponse;
type FailOpen<BI> = dyn Fn(&BI) -> bool;

/// Rate limit middleware.
///
/// For each request the input function picks the policy and identifier (or skips limiting
/// altogether by returning [None]), and the backend decides whether to admit it.
pub struct RateLimiter<BA, BI, BO, F> {
    backend: BA,
    input_fn: Rc<F>,
    fail_open: Rc<FailOpen<BI>>,
    allowed_mutation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
}

impl<BA, BI, BO, F, O> Clone for RateLimiter<BA, BI, BO, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            fail_open: self.fail_open.clone(),
            allowed_mutation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
        }
    }
}

impl<BA, BI, BO, F, O> RateLimiter<BA, BI, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: HeaderCompatibleOutput + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend based on the incoming request,
    ///   see [AdmissionInputBuilder](crate::backend::AdmissionInputBuilder).
    pub fn builder(backend: BA, input_fn: F) -> RateLimiterBuilder<BA, BI, BO, F> {
        RateLimiterBuilder::new(backend, input_fn)
    }
}

impl<S, B, BA, BI, BO, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, BI, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, BI, BO, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            backend: self.backend.clone(),
            input_fn: Rc::clone(&self.input_fn),
            fail_open: self.fail_open.clone(),
            allowed_transformation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, BI, BO, F> {
    service: Rc<RefCell<S>>,
    backend: BA,
    input_fn: Rc<F>,
    fail_open: Rc<FailOpen<BI>>,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
}

impl<S, B, BA, BI, BO, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, BI, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let backend = self.backend.clone();
        let input_fn = self.input_fn.clone();
        let fail_open = self.fail_open.clone();
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(Some(input)) => input,
                // Not subject to rate limiting
                Ok(None) => {
                    let response = service.call(req).await?;
                    return Ok(response.map_into_left_body());
                }
                Err(e) => {
                    log::error!("Rate limiter input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let fail_open = (fail_open)(&input);
            let output = match backend.request(input).await {
                // Able to successfully query rate limiter backend
                Ok((decision, output)) => {
                    if decision.is_denied() {
                        log::debug!("Rate limit exceeded for {} {}", req.method(), req.path());
                        let response: HttpResponse = (denied_response)(&output);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(output)
                }
                // Unable to query rate limiter backend
                Err(e) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {}, allowing the request anyway", e);
                        None
                    } else {
                        log::error!("Rate limiter failed: {}", e);
                        return Ok(req
                            .into_response(e.into().error_response())
                            .map_into_right_body());
                    }
                }
            };

            let mut service_response = service.call(req).await?;

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), output.as_ref());
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
