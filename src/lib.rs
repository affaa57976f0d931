// Gym Session - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{AuthFlows, AuthSessionContext, AuthState, AuthStore, Session, UserProfile};
pub use error::{ApiError, TransitionError};
pub use http_client::{HttpClient, HttpClientOptions};
