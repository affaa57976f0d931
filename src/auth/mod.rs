// Authentication module
// Session persistence, state machine and single-flight token refresh

mod context;
mod coordinator;
mod flows;
mod refresh;
mod store;
mod types;

pub use context::AuthSessionContext;
pub use coordinator::{PendingRequest, TokenRefreshCoordinator};
pub use flows::AuthFlows;
pub use refresh::{HttpTokenRefresher, TokenRefresher};
pub use store::AuthStore;
pub use types::{
    token_prefix, AuthSnapshot, AuthState, Credential, PersistedRecord, ProfileUpdate, Session,
    UpdateProfileRequest, UserProfile,
};
