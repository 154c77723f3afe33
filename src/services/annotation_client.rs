use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::models::annotation::{Annotation, AnnotationSet};
use crate::services::generator::{AnnotationGenerator, GenerateError};

const PROMPT: &str = concat!(
    "Identify every organism visible in this image. ",
    "Return ONLY valid JSON of the form ",
    r#"{"annotations": [{"label": string, "confidence": number, "bbox": [x, y, w, h] | null}], "model": string}"#,
    ", with bbox coordinates normalized to 0..1."
);

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// HTTP client for the annotation provider.
pub struct AnnotationClient {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    image_id: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ProviderResponse {
    result: ProviderResult,
}

#[derive(Deserialize)]
struct ProviderResult {
    description: String,
}

#[derive(Deserialize)]
struct GeneratedAnnotations {
    annotations: Vec<Annotation>,
    #[serde(default)]
    model: Option<String>,
}

impl AnnotationClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_token,
            timeout,
        })
    }
}

#[async_trait]
impl AnnotationGenerator for AnnotationClient {
    async fn generate(&self, item_id: &str) -> Result<AnnotationSet, GenerateError> {
        let body = AnnotateRequest {
            image_id: item_id,
            prompt: PROMPT,
            max_tokens: 512,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            return Err(classify_status(status, retry_after, message));
        }

        let envelope: ProviderResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::InvalidResponse(e.without_url().to_string()))?;

        let generated: GeneratedAnnotations =
            serde_json::from_str(strip_code_fence(&envelope.result.description))
                .map_err(|e| GenerateError::InvalidResponse(e.to_string()))?;

        Ok(AnnotationSet {
            item_id: item_id.to_string(),
            annotations: generated.annotations,
            model: generated.model,
        })
    }
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> GenerateError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerateError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerateError::Server {
            status: status.as_u16(),
            message,
        },
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
            GenerateError::Unsupported(message)
        }
        s if s.is_server_error() => GenerateError::Server {
            status: s.as_u16(),
            message,
        },
        s => GenerateError::Client {
            status: s.as_u16(),
            message,
        },
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> GenerateError {
    if err.is_timeout() {
        GenerateError::Timeout(timeout)
    } else if err.is_decode() {
        GenerateError::InvalidResponse(err.without_url().to_string())
    } else {
        GenerateError::Unavailable(err.without_url().to_string())
    }
}

/// Models sometimes wrap JSON in a markdown fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
