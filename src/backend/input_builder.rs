use crate::backend::AdmissionInput;
use crate::identifier::IdentifierResolver;
use crate::policy::{PolicyRouter, PolicySet};
use actix_web::dev::ServiceRequest;
use std::future::{ready, Ready};

type UserIdFn = Box<dyn Fn(&ServiceRequest) -> Option<String>>;

/// `None` means the request is not subject to rate limiting.
pub type AdmissionInputFuture = Ready<Result<Option<AdmissionInput>, actix_web::Error>>;

/// Utility to create the middleware input function that produces an [AdmissionInput].
///
/// The policy is picked from the request path by a [PolicyRouter], and the identifier by an
/// [IdentifierResolver].
pub struct AdmissionInputBuilder {
    router: PolicyRouter,
    policies: PolicySet,
    resolver: IdentifierResolver,
    user_id_fn: Option<UserIdFn>,
}

impl AdmissionInputBuilder {
    pub fn new(router: PolicyRouter, policies: PolicySet) -> Self {
        Self {
            router,
            policies,
            resolver: IdentifierResolver::default(),
            user_id_fn: None,
        }
    }

    /// The Draworld routes and production limits.
    pub fn draworld() -> Self {
        Self::new(PolicyRouter::draworld(), PolicySet::draworld())
    }

    /// Override how client addresses are turned into identifiers.
    pub fn resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Look up the authenticated user for a request.
    ///
    /// Authentication happens elsewhere, e.g. an earlier middleware placing the verified user
    /// id into the request extensions; this function only reads it back.
    pub fn user_id_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.user_id_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> AdmissionInputFuture + 'static {
        move |req| {
            let input = self.router.select(req.path()).map(|policy| {
                let user_id = self.user_id_fn.as_ref().and_then(|f| f(req));
                AdmissionInput {
                    policy,
                    limit: *self.policies.get(policy),
                    identifier: self.resolver.resolve(req.request(), user_id.as_deref()),
                }
            });
            ready(Ok(input))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyName;
    use actix_web::test::TestRequest;
    use actix_web::HttpMessage;

    #[derive(Clone)]
    struct UserId(String);

    #[actix_web::test]
    async fn test_inputs() {
        let input_fn = AdmissionInputBuilder::draworld()
            .user_id_fn(|req| req.extensions().get::<UserId>().map(|u| u.0.clone()))
            .build();

        let req = TestRequest::get()
            .uri("/api/auth/login")
            .insert_header(("X-Forwarded-For", "1.2.3.4"))
            .to_srv_request();
        let input = input_fn(&req).await.unwrap().unwrap();
        assert_eq!(input.policy, PolicyName::Authentication);
        assert_eq!(input.identifier, "ip:1.2.3.4");
        assert_eq!(input.limit.max_requests(), 10);

        let req = TestRequest::get().uri("/api/gallery").to_srv_request();
        req.extensions_mut().insert(UserId("u1".to_string()));
        let input = input_fn(&req).await.unwrap().unwrap();
        assert_eq!(input.policy, PolicyName::General);
        assert_eq!(input.identifier, "user:u1");
        assert_eq!(input.limit.max_requests(), 100);

        // Pages are not limited
        let req = TestRequest::get().uri("/gallery").to_srv_request();
        assert!(input_fn(&req).await.unwrap().is_none());
    }
}
