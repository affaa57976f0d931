// Authentication types

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Access/refresh token pair. Always replaced as a whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Both tokens must be non-empty for a session to be held
    pub fn is_complete(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.refresh_token.trim().is_empty()
    }
}

// Tokens never end up in logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &token_prefix(&self.access_token))
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Short, log-safe prefix of a token
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Access token a request carried, tagged with the sign-in that issued it
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub generation: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &token_prefix(&self.access_token))
            .field("generation", &self.generation)
            .finish()
    }
}

/// Signed-in user's profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, alias = "avatar", skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// Ids arrive as strings or as integers depending on the backend
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(id) => id,
        Id::Signed(id) => id.to_string(),
        Id::Unsigned(id) => id.to_string(),
    })
}

/// Partial profile; `None` fields keep their previous value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_ref: Option<String>,
}

impl ProfileUpdate {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.avatar_ref.is_none()
    }
}

impl UserProfile {
    /// Merge a partial update field by field
    pub fn merged(&self, update: &ProfileUpdate) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            name: update.name.clone().unwrap_or_else(|| self.name.clone()),
            email: update.email.clone().unwrap_or_else(|| self.email.clone()),
            avatar_ref: update.avatar_ref.clone().or_else(|| self.avatar_ref.clone()),
        }
    }
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthState {
    SignedOut,
    SignedIn,
    /// Transient; always resolves to SignedIn or SignedOut
    Refreshing,
}

/// Observable snapshot published on every state or profile change
#[derive(Debug, Clone)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub user: Option<UserProfile>,
    pub(crate) session: Option<Session>,
    /// Bumped by every sign-in; refreshes keep it
    pub generation: u64,
}

impl AuthSnapshot {
    pub(crate) fn signed_out() -> Self {
        Self {
            state: AuthState::SignedOut,
            user: None,
            session: None,
            generation: 0,
        }
    }

    pub(crate) fn credential(&self) -> Option<Credential> {
        match (self.state, &self.session) {
            (AuthState::SignedOut, _) | (_, None) => None,
            (_, Some(session)) => Some(Credential {
                access_token: session.access_token.clone(),
                generation: self.generation,
            }),
        }
    }
}

/// Durable record kept by the AuthStore
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub session: Session,
    pub user: UserProfile,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// POST /sessions request
#[derive(Serialize)]
pub struct SignInRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// POST /sessions response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
    pub user: UserProfile,
}

/// POST /token/refresh request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// POST /token/refresh response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
}

/// POST /users request
#[derive(Serialize)]
pub struct SignUpRequest<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

/// PUT /users request
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_password: Option<String>,
}
