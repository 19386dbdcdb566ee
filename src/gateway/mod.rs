//! Resilient multi-key gateway to a quota-limited generative AI API.
//!
//! Each call walks a snapshot of the credential pool in rotation order.
//! Transient failures are retried on the same credential with exponential
//! backoff, quota failures cool the credential down and move on,
//! permanent failures move on. The pool lock is never held across I/O, so
//! concurrent callers can each be using a different credential.

pub mod backend;
pub mod credential;
pub mod gemini;
pub mod pool;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::GatewaySettings;

pub use backend::{ApiError, GenerateRequest, Generation, GenerativeBackend, OutputFormat};
pub use credential::{credentials_from_env, parse_credentials, ApiCredential, CredentialError, KEYS_ENV};
pub use gemini::GeminiBackend;
pub use pool::{CredentialPool, PoolStatus};
pub use response::strip_code_fences;

/// Credential label reported when every credential failed
pub const EXHAUSTED_LABEL: &str = "all_keys_failed";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Every credential in the snapshot failed; retry later
    #[error("All {tried} credentials failed; last error: {last_error}")]
    Exhausted { tried: usize, last_error: ApiError },

    #[error("No credentials available ({cooling_down} cooling down)")]
    NoCredentials { cooling_down: usize },

    /// The model answered but not with valid JSON. Not retried.
    #[error("Response served by {credential} is not valid JSON: {source}")]
    Parse {
        credential: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// Which credential to blame in logs and task records
    pub fn credential_label(&self) -> &str {
        match self {
            Self::Exhausted { .. } => EXHAUSTED_LABEL,
            Self::Parse { credential, .. } => credential,
            _ => "N/A",
        }
    }
}

/// A successful call
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse<T> {
    pub value: T,
    /// Display name of the credential that served the call
    pub credential: String,
    pub tokens_used: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Attempts per credential on transient errors
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub model: String,
}

impl From<&GatewaySettings> for GatewayOptions {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            model: settings.model.clone(),
        }
    }
}

/// Constructed once per process and shared by reference
pub struct ApiGateway {
    backend: Arc<dyn GenerativeBackend>,
    pool: CredentialPool,
    options: GatewayOptions,
}

impl ApiGateway {
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        credentials: Vec<ApiCredential>,
        cooldown: Duration,
        options: GatewayOptions,
    ) -> Self {
        info!(
            backend = backend.name(),
            credentials = credentials.len(),
            cooldown_secs = cooldown.as_secs(),
            "Gateway initialized"
        );
        Self {
            backend,
            pool: CredentialPool::new(credentials, cooldown),
            options,
        }
    }

    /// Gemini backend with credentials from `LECTERN_API_KEYS`
    pub fn gemini_from_env(settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let credentials = credentials_from_env()?;
        let backend = GeminiBackend::new(Duration::from_secs(settings.timeout_secs))?;
        Ok(Self::new(
            Arc::new(backend),
            credentials,
            Duration::from_secs(settings.cooldown_secs),
            settings.into(),
        ))
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Ask for structured output; fences are stripped before parsing
    pub async fn prompt_for_json(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<GatewayResponse<Value>, GatewayError> {
        let (generation, credential) = self.execute(prompt, OutputFormat::Json, model).await?;
        let value = serde_json::from_str(strip_code_fences(&generation.text)).map_err(|source| {
            GatewayError::Parse {
                credential: credential.clone(),
                source,
            }
        })?;
        Ok(GatewayResponse {
            value,
            credential,
            tokens_used: generation.tokens_used.unwrap_or(0),
        })
    }

    /// Ask for free text (for example an HTML report)
    pub async fn prompt_for_text(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<GatewayResponse<String>, GatewayError> {
        let (generation, credential) = self.execute(prompt, OutputFormat::Text, model).await?;
        Ok(GatewayResponse {
            value: strip_code_fences(&generation.text).to_string(),
            credential,
            tokens_used: generation.tokens_used.unwrap_or(0),
        })
    }

    /// Models available to the first usable credential
    pub async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let snapshot = self.pool.snapshot();
        let Some(credential) = snapshot.first() else {
            return Err(GatewayError::NoCredentials {
                cooling_down: self.pool.cooling_count(),
            });
        };
        self.backend
            .list_models(credential)
            .await
            .map_err(|last_error| GatewayError::Exhausted { tried: 1, last_error })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.options.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }

    #[instrument(skip_all, fields(model = tracing::field::Empty, ?format))]
    async fn execute(
        &self,
        prompt: &str,
        format: OutputFormat,
        model: Option<&str>,
    ) -> Result<(Generation, String), GatewayError> {
        let request = GenerateRequest {
            model: model.unwrap_or(&self.options.model).to_string(),
            prompt: prompt.to_string(),
            format,
        };
        tracing::Span::current().record("model", request.model.as_str());

        let snapshot = self.pool.snapshot();
        if snapshot.is_empty() {
            let cooling_down = self.pool.cooling_count();
            warn!(cooling_down, "Credential pool is empty");
            return Err(GatewayError::NoCredentials { cooling_down });
        }

        let attempts = self.options.max_retries.max(1);
        let mut last_error = None;

        for (index, credential) in snapshot.iter().enumerate() {
            info!(
                credential = %credential,
                position = index + 1,
                of = snapshot.len(),
                "Trying credential"
            );

            for attempt in 0..attempts {
                let error = match self.backend.generate(credential, &request).await {
                    Ok(generation) => {
                        self.pool.rotate_to_back(credential);
                        info!(credential = %credential, attempt = attempt + 1, "Request succeeded");
                        return Ok((generation, credential.display_name().to_string()));
                    }
                    Err(error) => error,
                };

                let give_up = match &error {
                    ApiError::Quota(message) => {
                        warn!(credential = %credential, %message, "Quota exhausted");
                        self.pool.cool_down(credential);
                        true
                    }
                    ApiError::Permanent(message) => {
                        warn!(credential = %credential, %message, "Permanent failure, switching credential");
                        true
                    }
                    ApiError::Transient(message) => {
                        let last = attempt + 1 >= attempts;
                        if !last {
                            let delay = self.backoff(attempt);
                            warn!(
                                credential = %credential,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                %message,
                                "Transient failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        last
                    }
                };
                last_error = Some(error);
                if give_up {
                    break;
                }
            }
        }

        match last_error {
            Some(last_error) => {
                warn!(tried = snapshot.len(), error = %last_error, "All credentials failed");
                Err(GatewayError::Exhausted {
                    tried: snapshot.len(),
                    last_error,
                })
            }
            None => Err(GatewayError::NoCredentials {
                cooling_down: self.pool.cooling_count(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl GenerativeBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            _credential: &ApiCredential,
            _request: &GenerateRequest,
        ) -> Result<Generation, ApiError> {
            Ok(Generation {
                text: self.0.to_string(),
                tokens_used: Some(12),
            })
        }

        async fn list_models(&self, _credential: &ApiCredential) -> Result<Vec<String>, ApiError> {
            Ok(vec!["models/fixed".to_string()])
        }
    }

    fn gateway(text: &'static str, credentials: Vec<ApiCredential>) -> ApiGateway {
        ApiGateway::new(
            Arc::new(Fixed(text)),
            credentials,
            Duration::from_secs(60),
            GatewayOptions {
                max_retries: 3,
                backoff_base: Duration::from_millis(1),
                model: "test-model".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_json_is_unfenced_and_parsed() {
        let gw = gateway("```json\n{\"title\": \"x\"}\n```", vec![ApiCredential::new("v", "only")]);
        let response = gw.prompt_for_json("p", None).await.unwrap();
        assert_eq!(response.value, serde_json::json!({"title": "x"}));
        assert_eq!(response.credential, "only");
        assert_eq!(response.tokens_used, 12);
    }

    #[tokio::test]
    async fn test_unparseable_json_is_a_parse_error() {
        let gw = gateway("not json at all", vec![ApiCredential::new("v", "only")]);
        let err = gw.prompt_for_json("p", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Parse { .. }));
        assert_eq!(err.credential_label(), "only");
    }

    #[tokio::test]
    async fn test_text_and_empty_pool() {
        let gw = gateway("```html\n<h1>r</h1>\n```", vec![ApiCredential::new("v", "only")]);
        assert_eq!(gw.prompt_for_text("p", None).await.unwrap().value, "<h1>r</h1>");
        assert_eq!(gw.list_models().await.unwrap(), vec!["models/fixed"]);

        let empty = gateway("x", Vec::new());
        let err = empty.prompt_for_text("p", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCredentials { cooling_down: 0 }));
    }

    #[test]
    fn test_backoff_doubles() {
        let gw = ApiGateway::new(
            Arc::new(Fixed("")),
            Vec::new(),
            Duration::from_secs(60),
            GatewayOptions::from(&GatewaySettings::default()),
        );
        assert_eq!(gw.backoff(0), Duration::from_secs(2));
        assert_eq!(gw.backoff(1), Duration::from_secs(4));
    }
}
