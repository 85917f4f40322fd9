use crate::policy::PolicyName;

/// Maps request paths to the [PolicyName] the middleware should apply.
///
/// Rules are matched on whole path segments: a rule for `/api/auth` covers `/api/auth` and
/// `/api/auth/login`, but not `/api/authors`. When several rules match, the longest one wins.
/// Paths that match no rule fall back to the policy registered with
/// [PolicyRouter::fallback], if they are beneath its prefix, otherwise they are not limited.
#[derive(Debug, Clone, Default)]
pub struct PolicyRouter {
    routes: Vec<(String, PolicyName)>,
    fallback: Option<(String, PolicyName)>,
}

impl PolicyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authentication endpoints use the authentication policy, the rest of the API the
    /// general one.
    ///
    /// Endpoints with stricter limits (video generation, uploads, payments) select their
    /// policy explicitly in the handler via
    /// [AdmissionController::admit](crate::AdmissionController::admit).
    pub fn draworld() -> Self {
        Self::new()
            .route("/api/auth", PolicyName::Authentication)
            .route("/api/login", PolicyName::Authentication)
            .route("/api/signup", PolicyName::Authentication)
            .fallback("/api", PolicyName::General)
    }

    pub fn route(mut self, prefix: &str, policy: PolicyName) -> Self {
        self.routes.push((normalize(prefix), policy));
        // Longest first, so the first match is the most specific one.
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn fallback(mut self, prefix: &str, policy: PolicyName) -> Self {
        self.fallback = Some((normalize(prefix), policy));
        self
    }

    pub fn select(&self, path: &str) -> Option<PolicyName> {
        self.routes
            .iter()
            .chain(self.fallback.iter())
            .find(|(prefix, _)| matches_prefix(path, prefix))
            .map(|(_, policy)| *policy)
    }
}

fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
