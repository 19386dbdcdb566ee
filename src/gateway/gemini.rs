//! Google Generative Language REST backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::{ApiError, GenerateRequest, Generation, GenerativeBackend, OutputFormat};
use super::credential::ApiCredential;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

pub struct GeminiBackend {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn generate_url(&self, model: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_http(status, &body))
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        credential: &ApiCredential,
        request: &GenerateRequest,
    ) -> Result<Generation, ApiError> {
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart {
                    text: &request.prompt,
                }],
            }],
            generation_config: match request.format {
                OutputFormat::Json => Some(GenerationConfig {
                    response_mime_type: "application/json",
                }),
                OutputFormat::Text => None,
            },
        };

        debug!(model = %request.model, credential = %credential, "Calling Gemini");
        let response = self
            .http
            .post(self.generate_url(&request.model))
            .header("x-goog-api-key", credential.value())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let response: GeminiResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("Unreadable response: {e}")))?;

        let text: String = response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();

        if text.trim().is_empty() {
            return Err(ApiError::Transient("Empty response content".to_string()));
        }

        Ok(Generation {
            text,
            tokens_used: response.usage_metadata.and_then(|u| u.total_token_count),
        })
    }

    async fn list_models(&self, credential: &ApiCredential) -> Result<Vec<String>, ApiError> {
        let response = self
            .http
            .get(format!("{}/v1beta/models", self.base_url))
            .header("x-goog-api-key", credential.value())
            .send()
            .await
            .map_err(transport_error)?;

        let list: ModelList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("Unreadable model list: {e}")))?;

        Ok(list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| m.name)
            .collect())
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    // timeouts, refused and reset connections are all worth another try
    ApiError::Transient(format!("Request failed: {e}"))
}

/// Map an HTTP failure onto the gateway's error classes
pub fn classify_http(status: StatusCode, body: &str) -> ApiError {
    let (google_status, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.status, envelope.error.message),
        Err(_) => (String::new(), body.to_string()),
    };
    let summary = if google_status.is_empty() {
        format!("{status}: {message}")
    } else {
        format!("{status} {google_status}: {message}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || google_status == "RESOURCE_EXHAUSTED" {
        return ApiError::Quota(summary);
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ApiError::Transient(summary);
    }
    if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) {
        return ApiError::Permanent(summary);
    }
    ApiError::classify(summary)
}
