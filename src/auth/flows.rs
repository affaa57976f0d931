// Sign-in, sign-up, sign-out and profile update orchestration

use reqwest::Method;
use std::sync::Arc;

use super::context::AuthSessionContext;
use super::types::{
    ProfileUpdate, Session, SignInRequest, SignInResponse, SignUpRequest, UpdateProfileRequest,
    UserProfile,
};
use crate::error::{ApiError, TransitionError};
use crate::http_client::{decode_json, HttpClient};

/// Thin orchestrators over the HTTP client and the session context
#[derive(Clone)]
pub struct AuthFlows {
    http: Arc<HttpClient>,
    context: Arc<AuthSessionContext>,
}

impl AuthFlows {
    pub fn new(http: Arc<HttpClient>) -> Self {
        let context = http.context().clone();
        Self { http, context }
    }

    pub fn context(&self) -> &Arc<AuthSessionContext> {
        &self.context
    }

    /// `POST /sessions`; on success the session is persisted and signed in.
    /// Failures leave the session state untouched.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        tracing::info!(email = %email, "Signing in");

        let request = self.http.build(
            self.http
                .request(Method::POST, "/sessions")
                .json(&SignInRequest { email, password }),
        )?;
        let response = self.http.send_unauthenticated(request).await?;
        let data: SignInResponse = decode_json(response).await?;

        let user = data.user;
        self.context
            .sign_in(Session::new(data.access_token, data.refresh_token), user.clone())
            .await?;
        Ok(user)
    }

    /// `POST /users`; creating an account does not sign in
    pub async fn sign_up(&self, name: &str, email: &str, password: &str) -> Result<(), ApiError> {
        tracing::info!(email = %email, "Creating account");

        let request = self.http.build(
            self.http
                .request(Method::POST, "/users")
                .json(&SignUpRequest {
                    name,
                    email,
                    password,
                }),
        )?;
        self.http.send_unauthenticated(request).await?;
        Ok(())
    }

    /// Discards local state only, so it works offline
    pub async fn sign_out(&self) {
        self.context.sign_out().await;
    }

    /// `PUT /users`, then merge the new name into the local profile
    pub async fn update_profile(
        &self,
        request: UpdateProfileRequest,
    ) -> Result<UserProfile, ApiError> {
        if request.password.is_some() && request.old_password.is_none() {
            return Err(ApiError::Validation(
                "old password is required to change the password".to_string(),
            ));
        }

        let _: Option<serde_json::Value> = self.http.put_json("/users", &request).await?;

        let update = ProfileUpdate {
            name: request.name,
            ..Default::default()
        };
        if update.is_empty() {
            return self
                .context
                .user()
                .ok_or(ApiError::from(TransitionError::SignedOut));
        }
        self.context.update_profile(update).await
    }
}
