use crate::policy::{PolicyName, PolicySet, RateLimitPolicy};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read rate limit policy file: {0}")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
    #[error("Invalid rate limit policy file: {0}")]
    Json(
        #[source]
        #[from]
        serde_json::Error,
    ),
}

impl PolicySet {
    /// Load policy overrides from JSON, keeping the production limit for any policy that is
    /// not mentioned.
    ///
    /// ```
    /// # use draworld_admission::policy::{PolicyName, PolicySet};
    /// let set = PolicySet::from_json_str(
    ///     r#"{"payment": {"window_ms": 60000, "max_requests": 2}}"#,
    /// )
    /// .unwrap();
    /// assert_eq!(set.get(PolicyName::Payment).max_requests(), 2);
    /// assert_eq!(set.get(PolicyName::General).max_requests(), 100);
    /// ```
    ///
    /// A zero window or max request count is rejected here, so that a misconfigured process
    /// fails at startup rather than on a request.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let overrides: HashMap<PolicyName, RateLimitPolicy> = serde_json::from_str(json)?;
        Ok(overrides
            .into_iter()
            .fold(PolicySet::draworld(), |set, (name, policy)| {
                set.with_policy(name, policy)
            }))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
