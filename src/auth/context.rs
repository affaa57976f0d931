use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::coordinator::TokenRefreshCoordinator;
use super::store::AuthStore;
use super::types::{
    token_prefix, AuthSnapshot, AuthState, Credential, ProfileUpdate, Session, UserProfile,
};
use crate::error::{ApiError, TransitionError};

/// In-memory session state machine and user profile
///
/// Single writer of [`AuthState`]. Reads are lock-free snapshots of the watch
/// channel; every mutation holds `write_lock` across its storage call so the
/// durable record and the published snapshot change in the same order.
pub struct AuthSessionContext {
    /// Current snapshot, observable through [`AuthSessionContext::subscribe`]
    snapshot: watch::Sender<AuthSnapshot>,

    /// Serializes mutations together with their persistence
    write_lock: Mutex<()>,

    /// Durable storage
    store: AuthStore,

    /// Refresh coordinator shared by every client built on this context
    coordinator: StdMutex<Weak<TokenRefreshCoordinator>>,
}

impl AuthSessionContext {
    /// Create a signed-out context
    pub fn new(store: AuthStore) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::signed_out());
        Self {
            snapshot,
            write_lock: Mutex::new(()),
            store,
            coordinator: StdMutex::new(Weak::new()),
        }
    }

    /// Create a context from whatever the store holds; called once at startup
    pub async fn restore(store: AuthStore) -> Self {
        let context = Self::new(store);

        match context.store.load().await {
            (Some(session), Some(user)) => {
                tracing::info!(user_id = %user.id, "Restored persisted session");
                context.snapshot.send_replace(AuthSnapshot {
                    state: AuthState::SignedIn,
                    user: Some(user),
                    session: Some(session),
                    generation: 1,
                });
            }
            _ => tracing::info!("No usable persisted session, starting signed out"),
        }

        context
    }

    pub fn state(&self) -> AuthState {
        self.snapshot.borrow().state
    }

    pub fn current_access_token(&self) -> Option<String> {
        self.snapshot
            .borrow()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn current_session(&self) -> Option<Session> {
        self.snapshot.borrow().session.clone()
    }

    /// Access token and the sign-in it belongs to, read in one step
    pub fn current_credential(&self) -> Option<Credential> {
        self.snapshot.borrow().credential()
    }

    /// Sign-in generation; bumped by every sign-in, kept across refreshes
    pub fn generation(&self) -> u64 {
        self.snapshot.borrow().generation
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.snapshot.receiver_count()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&AuthSnapshot) -> R) -> R {
        f(&self.snapshot.borrow())
    }

    /// The context's refresh coordinator, created by the first client that asks
    pub(crate) fn coordinator_or_init(
        &self,
        init: impl FnOnce() -> TokenRefreshCoordinator,
    ) -> Arc<TokenRefreshCoordinator> {
        let mut slot = self.coordinator.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.upgrade() {
            return existing;
        }

        let coordinator = Arc::new(init());
        *slot = Arc::downgrade(&coordinator);
        coordinator
    }

    /// Refreshing still counts: the session is being renewed, not lost
    pub fn is_signed_in(&self) -> bool {
        self.state() != AuthState::SignedOut
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.snapshot.borrow().user.clone()
    }

    /// Subscribe to state and profile changes
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.subscribe()
    }

    /// Persist a new session and transition to SignedIn
    pub async fn sign_in(&self, session: Session, user: UserProfile) -> Result<(), ApiError> {
        if !session.is_complete() {
            return Err(ApiError::InvalidSession(
                "access and refresh tokens must be non-empty".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        if self.state() == AuthState::Refreshing {
            return Err(TransitionError::Refreshing.into());
        }

        self.store.save(&session, &user).await?;

        tracing::info!(user_id = %user.id, token = %token_prefix(&session.access_token), "Signed in");
        self.snapshot.send_modify(|snapshot| {
            *snapshot = AuthSnapshot {
                state: AuthState::SignedIn,
                user: Some(user),
                session: Some(session),
                generation: snapshot.generation + 1,
            };
        });
        Ok(())
    }

    /// SignedIn -> Refreshing. Returns the session whose refresh token should be used.
    pub async fn begin_refresh(&self) -> Result<Session, TransitionError> {
        self.begin_refresh_with_generation()
            .await
            .map(|(session, _)| session)
    }

    /// Like [`begin_refresh`](Self::begin_refresh), also returning the sign-in
    /// generation being refreshed
    pub(crate) async fn begin_refresh_with_generation(
        &self,
    ) -> Result<(Session, u64), TransitionError> {
        let _guard = self.write_lock.lock().await;
        let mut result = Err(TransitionError::SignedOut);

        self.snapshot.send_if_modified(|snapshot| match snapshot.state {
            AuthState::Refreshing => {
                result = Err(TransitionError::AlreadyRefreshing);
                false
            }
            AuthState::SignedOut => false,
            AuthState::SignedIn => match snapshot.session.clone() {
                Some(session) => {
                    snapshot.state = AuthState::Refreshing;
                    result = Ok((session, snapshot.generation));
                    true
                }
                None => false,
            },
        });

        if result.is_ok() {
            tracing::debug!("Session state: SignedIn -> Refreshing");
        }
        result
    }

    /// Refreshing -> SignedIn with the renewed session
    pub async fn complete_refresh(&self, session: Session) -> Result<(), ApiError> {
        if !session.is_complete() {
            return Err(ApiError::InvalidSession(
                "refresh returned an empty token".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let (state, user) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.state, snapshot.user.clone())
        };
        if state != AuthState::Refreshing {
            return Err(TransitionError::NotRefreshing.into());
        }

        if let Some(ref user) = user {
            // The previous refresh token has been rotated away; keep the new one in memory
            if let Err(e) = self.store.save(&session, user).await {
                tracing::error!(error = %e, "Failed to persist renewed session");
            }
        }

        tracing::info!(token = %token_prefix(&session.access_token), "Session state: Refreshing -> SignedIn");
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = AuthState::SignedIn;
            snapshot.session = Some(session);
        });
        Ok(())
    }

    /// Any state -> SignedOut. Idempotent and never fails.
    pub async fn sign_out(&self) {
        self.sign_out_if(|_| true).await;
    }

    /// Sign out only if the session still belongs to sign-in `generation`.
    /// Returns false when a newer sign-in has replaced it.
    pub async fn expire(&self, generation: u64) -> bool {
        self.sign_out_if(|snapshot| snapshot.generation == generation)
            .await
    }

    async fn sign_out_if(&self, matches: impl FnOnce(&AuthSnapshot) -> bool) -> bool {
        let _guard = self.write_lock.lock().await;
        if !self.read(matches) {
            tracing::debug!("Session was replaced by a newer sign-in, not signing out");
            return false;
        }

        // Local state is discarded even if the store cannot be cleared
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear persisted session");
        }

        let changed = self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == AuthState::SignedOut && snapshot.session.is_none() {
                return false;
            }
            *snapshot = AuthSnapshot {
                generation: snapshot.generation,
                ..AuthSnapshot::signed_out()
            };
            true
        });

        if changed {
            tracing::info!("Signed out");
        }
        true
    }

    /// Wait for a refresh started elsewhere to settle
    ///
    /// Returns the renewed credential, or `None` if the session was lost or
    /// the refresh did not settle within `timeout`.
    pub async fn wait_for_refresh(&self, timeout: Duration) -> Option<Credential> {
        let mut rx = self.snapshot.subscribe();
        let settled =
            tokio::time::timeout(timeout, rx.wait_for(|s| s.state != AuthState::Refreshing)).await;

        match settled {
            Ok(Ok(snapshot)) => snapshot.credential(),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Refresh in progress did not settle in time");
                None
            }
        }
    }

    /// Merge a partial profile into the current one and persist the result
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, ApiError> {
        let _guard = self.write_lock.lock().await;
        let (session, user) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.session.clone(), snapshot.user.clone())
        };
        let (session, user) = match (session, user) {
            (Some(session), Some(user)) => (session, user),
            _ => return Err(TransitionError::SignedOut.into()),
        };

        let merged = user.merged(&update);
        self.store.save(&session, &merged).await?;

        self.snapshot.send_modify(|snapshot| {
            snapshot.user = Some(merged.clone());
        });
        tracing::debug!(user_id = %merged.id, "Profile updated");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserProfile {
        UserProfile {
            id: "1".to_string(),
            name: "Old Name".to_string(),
            email: "a@b.com".to_string(),
            avatar_ref: Some("avatar.png".to_string()),
        }
    }

    async fn signed_in() -> (AuthSessionContext, AuthStore) {
        let store = AuthStore::open_in_memory().unwrap();
        let context = AuthSessionContext::new(store.clone());
        context.sign_in(Session::new("t1", "r1"), user()).await.unwrap();
        (context, store)
    }

    #[tokio::test]
    async fn test_sign_in_persists_record() {
        let (context, store) = signed_in().await;
        assert_eq!(context.state(), AuthState::SignedIn);
        assert!(context.is_signed_in());
        assert_eq!(context.current_access_token().as_deref(), Some("t1"));

        let (session, profile) = store.load().await;
        assert_eq!(session, Some(Session::new("t1", "r1")));
        assert_eq!(profile, Some(user()));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let (_, store) = signed_in().await;
        let restored = AuthSessionContext::restore(store).await;
        assert_eq!(restored.state(), AuthState::SignedIn);
        assert_eq!(restored.user(), Some(user()));
    }

    #[tokio::test]
    async fn test_restore_empty_store_is_signed_out() {
        let context = AuthSessionContext::restore(AuthStore::open_in_memory().unwrap()).await;
        assert_eq!(context.state(), AuthState::SignedOut);
        assert!(context.current_access_token().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_rejects_empty_tokens() {
        let context = AuthSessionContext::new(AuthStore::open_in_memory().unwrap());
        let err = context.sign_in(Session::new("", "r1"), user()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidSession(_)));
        assert_eq!(context.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_re_sign_in_replaces_user() {
        let (context, store) = signed_in().await;
        let other = UserProfile {
            id: "2".to_string(),
            name: "Other".to_string(),
            email: "c@d.com".to_string(),
            avatar_ref: None,
        };
        context.sign_in(Session::new("t9", "r9"), other.clone()).await.unwrap();

        assert_eq!(context.user(), Some(other.clone()));
        assert_eq!(store.load().await.1, Some(other));
    }

    #[tokio::test]
    async fn test_refresh_cycle() {
        let (context, store) = signed_in().await;

        let session = context.begin_refresh().await.unwrap();
        assert_eq!(session.refresh_token, "r1");
        assert_eq!(context.state(), AuthState::Refreshing);
        assert!(context.is_signed_in());

        assert_eq!(
            context.begin_refresh().await.unwrap_err(),
            TransitionError::AlreadyRefreshing
        );

        context.complete_refresh(Session::new("t2", "r2")).await.unwrap();
        assert_eq!(context.state(), AuthState::SignedIn);
        assert_eq!(context.current_access_token().as_deref(), Some("t2"));
        assert_eq!(store.load().await.0, Some(Session::new("t2", "r2")));
    }

    #[tokio::test]
    async fn test_begin_refresh_when_signed_out() {
        let context = AuthSessionContext::new(AuthStore::open_in_memory().unwrap());
        assert_eq!(
            context.begin_refresh().await.unwrap_err(),
            TransitionError::SignedOut
        );
    }

    #[tokio::test]
    async fn test_complete_refresh_after_sign_out_is_rejected() {
        let (context, store) = signed_in().await;
        context.begin_refresh().await.unwrap();
        context.sign_out().await;

        let err = context
            .complete_refresh(Session::new("t2", "r2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Transition(TransitionError::NotRefreshing)
        ));
        assert_eq!(context.state(), AuthState::SignedOut);
        assert_eq!(store.load().await, (None, None));
    }

    #[tokio::test]
    async fn test_sign_out_is_idempotent() {
        let (context, store) = signed_in().await;

        context.sign_out().await;
        assert_eq!(context.state(), AuthState::SignedOut);

        context.sign_out().await;
        assert_eq!(context.state(), AuthState::SignedOut);
        assert!(context.user().is_none());
        assert_eq!(store.load().await, (None, None));
    }

    #[tokio::test]
    async fn test_sign_in_during_refresh_is_rejected() {
        let (context, _) = signed_in().await;
        context.begin_refresh().await.unwrap();

        let err = context
            .sign_in(Session::new("t5", "r5"), user())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transition(TransitionError::Refreshing)));
    }

    #[tokio::test]
    async fn test_update_profile_merges_and_persists() {
        let (context, store) = signed_in().await;

        let merged = context
            .update_profile(ProfileUpdate::name("New Name"))
            .await
            .unwrap();
        assert_eq!(merged.name, "New Name");
        assert_eq!(merged.email, "a@b.com");
        assert_eq!(merged.avatar_ref.as_deref(), Some("avatar.png"));
        assert_eq!(context.state(), AuthState::SignedIn);

        let (_, persisted) = store.load().await;
        assert_eq!(persisted, Some(merged));
    }

    #[tokio::test]
    async fn test_update_profile_requires_session() {
        let context = AuthSessionContext::new(AuthStore::open_in_memory().unwrap());
        let err = context
            .update_profile(ProfileUpdate::name("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transition(TransitionError::SignedOut)));
    }

    #[tokio::test]
    async fn test_generation_follows_sign_ins_not_refreshes() {
        let (context, _) = signed_in().await;
        assert_eq!(context.generation(), 1);

        context.begin_refresh().await.unwrap();
        context.complete_refresh(Session::new("t2", "r2")).await.unwrap();
        let credential = context.current_credential().unwrap();
        assert_eq!(credential.access_token, "t2");
        assert_eq!(credential.generation, 1);

        context.sign_out().await;
        assert!(context.current_credential().is_none());
        context.sign_in(Session::new("t9", "r9"), user()).await.unwrap();
        assert_eq!(context.generation(), 2);
    }

    #[tokio::test]
    async fn test_expire_leaves_newer_sign_in_alone() {
        let (context, store) = signed_in().await;
        let stale = context.generation();
        context.sign_in(Session::new("t9", "r9"), user()).await.unwrap();

        assert!(!context.expire(stale).await);
        assert_eq!(context.state(), AuthState::SignedIn);
        assert_eq!(store.load().await.0, Some(Session::new("t9", "r9")));

        assert!(context.expire(context.generation()).await);
        assert_eq!(context.state(), AuthState::SignedOut);
        assert_eq!(store.load().await, (None, None));
    }

    #[tokio::test]
    async fn test_wait_for_refresh_returns_renewed_credential() {
        let (context, _) = signed_in().await;
        let context = std::sync::Arc::new(context);
        context.begin_refresh().await.unwrap();

        let waiter = {
            let context = context.clone();
            tokio::spawn(async move { context.wait_for_refresh(Duration::from_secs(5)).await })
        };
        context.complete_refresh(Session::new("t2", "r2")).await.unwrap();

        let credential = waiter.await.unwrap().unwrap();
        assert_eq!(credential.access_token, "t2");
    }

    #[tokio::test]
    async fn test_wait_for_refresh_times_out() {
        let (context, _) = signed_in().await;
        context.begin_refresh().await.unwrap();

        assert!(context
            .wait_for_refresh(Duration::from_millis(20))
            .await
            .is_none());
        assert_eq!(context.state(), AuthState::Refreshing);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let (context, _) = signed_in().await;
        let mut rx = context.subscribe();
        assert_eq!(rx.borrow_and_update().state, AuthState::SignedIn);

        context.sign_out().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, AuthState::SignedOut);
    }
}
