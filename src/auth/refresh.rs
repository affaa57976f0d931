// Token refresh logic

use async_trait::async_trait;
use reqwest::Client;

use super::types::{RefreshRequest, RefreshResponse, Session};
use crate::error::ApiError;

/// Remote credential-renewal endpoint
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a new session. The refresh token is
    /// assumed single-use: the returned pair replaces it entirely.
    async fn refresh(&self, refresh_token: &str) -> Result<Session, ApiError>;
}

/// Calls `POST {base_url}/token/refresh`
pub struct HttpTokenRefresher {
    client: Client,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/token/refresh", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<Session, ApiError> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let err = ApiError::from_response(response).await;
            tracing::error!(status = status.as_u16(), error = %err, "Token refresh rejected");
            return Err(err);
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(format!("Failed to parse refresh response: {}", e)))?;

        let session = Session::new(data.access_token, data.refresh_token);
        if !session.is_complete() {
            return Err(ApiError::InvalidSession(
                "refresh response does not contain both tokens".to_string(),
            ));
        }

        tracing::info!("Access token refreshed");
        Ok(session)
    }
}
