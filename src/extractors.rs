use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRef;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use tracing::error;

use crate::error::RelayError;
use crate::AppState;

/// Gemini API key taken from the application state, rejects the request when none is configured
pub(crate) struct ApiKey(pub(crate) Arc<str>);

#[async_trait]
impl<S> FromRequestParts<S> for ApiKey
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match AppState::from_ref(state).api_key {
            Some(key) => Ok(ApiKey(key)),
            None => {
                error!("Refusing request, no Gemini API key is configured");
                Err(RelayError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Server Configuration Error: API Key missing".into(),
                })
            }
        }
    }
}
