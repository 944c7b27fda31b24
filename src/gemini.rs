use anyhow::Result;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Instruction sent alongside every uploaded portrait
pub(crate) const PROMPT: &str = "Passport-size photo of a man wearing a black blazer, white shirt, and a solid black tie, strictly following the reference image for facial features and pose. The background must be plain white, clean, and professional. The final output must be in standard passport photo dimensions (2x2 inches or 51x51 mm) with realistic lighting and sharp details, perfect for official use";

pub(crate) const IMAGE_MIME_TYPE: &str = "image/png";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Gemini API returned {status}")]
    Api {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("Invalid Gemini endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    /// Transport and decoding failures, the URL is stripped since it carries the API key
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part<'a> {
    Text(&'a str),
    InlineData(Blob<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: &'static [&'static str],
}

#[derive(Deserialize, Debug, Default)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<ContentResponse>,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ContentResponse {
    #[serde(default)]
    pub parts: Vec<PartResponse>,
}

/// Only inline data matters here, text and other part kinds are ignored
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PartResponse {
    pub inline_data: Option<BlobResponse>,
}

#[derive(Deserialize, Debug)]
pub struct BlobResponse {
    #[serde(default)]
    pub data: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    error: Option<ErrorDetails>,
}

#[derive(Deserialize)]
struct ErrorDetails {
    message: Option<String>,
}

impl GenerateContentResponse {
    /// Base64 data of the first inline part of the first candidate.
    ///
    /// An inline part without data is treated as no image at all, later parts are not consulted.
    pub fn first_inline_image(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|part| part.inline_data.as_ref())
            .map(|blob| blob.data.as_str())
            .filter(|data| !data.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        Url::parse(base_url)?;
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn endpoint(&self, api_key: &str) -> Result<Url, url::ParseError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        Url::parse_with_params(&url, [("key", api_key)])
    }

    /// Sends the portrait with the passport prompt, only image output is requested
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, image_len = image.len()))]
    pub async fn generate_image(
        &self,
        api_key: &str,
        image: &str,
    ) -> Result<GenerateContentResponse, GenerationError> {
        let response = self
            .http
            .post(self.endpoint(api_key)?)
            .json(&GenerateContentRequest {
                contents: [Content {
                    parts: [
                        Part::Text(PROMPT),
                        Part::InlineData(Blob {
                            mime_type: IMAGE_MIME_TYPE,
                            data: image,
                        }),
                    ],
                }],
                generation_config: GenerationConfig {
                    response_modalities: &["IMAGE"],
                },
            })
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map_err(reqwest::Error::without_url)?;
            let message = serde_json::from_slice::<ErrorResponse>(&body)
                .unwrap_or_default()
                .error
                .and_then(|error| error.message)
                .filter(|message| !message.is_empty());
            warn!(%status, ?message, "Gemini API rejected the request");
            return Err(GenerationError::Api { status, message });
        }

        let response: GenerateContentResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)?;
        debug!(
            candidates = response.candidates.len(),
            finish_reason = ?response.candidates.first().and_then(|c| c.finish_reason.as_deref()),
            "Gemini API responded"
        );
        Ok(response)
    }
}
