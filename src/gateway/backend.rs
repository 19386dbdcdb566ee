use async_trait::async_trait;
use thiserror::Error;

use super::credential::ApiCredential;

/// What the caller wants back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub format: OutputFormat,
}

/// Raw model output
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tokens_used: Option<u64>,
}

/// One failed call, classified by how the gateway should react
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Timeout, 5xx, reset: retry on the same credential
    #[error("transient: {0}")]
    Transient(String),

    /// Rate limit or quota: cool the credential down
    #[error("quota: {0}")]
    Quota(String),

    /// Bad key, permission, bad argument: move on
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ApiError {
    /// Classify free-form error text. Quota wins over permanent, anything
    /// unrecognised is treated as transient.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if ["quota", "resource_exhausted", "resourceexhausted", "429", "rate limit"]
            .iter()
            .any(|s| lower.contains(s))
        {
            Self::Quota(message)
        } else if [
            "permission_denied",
            "invalid_api_key",
            "api_key_invalid",
            "invalid_argument",
        ]
        .iter()
        .any(|s| lower.contains(s))
        {
            Self::Permanent(message)
        } else {
            Self::Transient(message)
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Quota(m) | Self::Permanent(m) => m,
        }
    }
}

/// A generative model endpoint, called with one credential at a time
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn generate(
        &self,
        credential: &ApiCredential,
        request: &GenerateRequest,
    ) -> Result<Generation, ApiError>;

    /// Models that support content generation
    async fn list_models(&self, credential: &ApiCredential) -> Result<Vec<String>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(matches!(
            ApiError::classify("429 Resource has been exhausted (e.g. check quota)."),
            ApiError::Quota(_)
        ));
        assert!(matches!(
            ApiError::classify("ResourceExhausted: try later"),
            ApiError::Quota(_)
        ));
        assert!(matches!(
            ApiError::classify("400 INVALID_ARGUMENT: API key not valid"),
            ApiError::Permanent(_)
        ));
        assert!(matches!(
            ApiError::classify("403 PERMISSION_DENIED"),
            ApiError::Permanent(_)
        ));
        assert!(matches!(
            ApiError::classify("503 Service Unavailable"),
            ApiError::Transient(_)
        ));
    }
}
