// Single-flight token refresh
//
// The first request to hit a 401 starts one refresh round on a spawned task;
// every request that hits a 401 while the round is running joins the queue.
// The round drains the queue in arrival order, replaying each request with
// the renewed token, or rejects all of them with SessionExpired. There is one
// coordinator per session context, shared by every client built on it.

use reqwest::{Client, Request, Response};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use super::context::AuthSessionContext;
use super::refresh::TokenRefresher;
use super::types::{Credential, Session};
use crate::error::{ApiError, TransitionError};
use crate::http_client::{attach_token, execute, Classified};

/// A caller blocked on the current refresh round
pub struct PendingRequest {
    /// Short id for log correlation
    id: String,

    /// Request as first sent, replayed with the renewed token
    request: Request,

    /// The caller's own client; replays keep its timeouts
    client: Client,

    /// Sign-in the request was sent under
    generation: u64,

    /// Resolves the waiting caller; a dropped receiver means the caller gave up
    reply: oneshot::Sender<Result<Response, ApiError>>,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,

    /// Access token the running round obtained, recorded before it is published
    renewed: Option<String>,

    /// Requests rejected while carrying `renewed`; they wait for a follow-up round
    next_round: VecDeque<PendingRequest>,
}

/// Owns the refresh protocol: one renewal call per round, FIFO replay
pub struct TokenRefreshCoordinator {
    context: Arc<AuthSessionContext>,
    refresher: Arc<dyn TokenRefresher>,

    /// Upper bound on one renewal call
    refresh_timeout: Duration,

    /// Guards "check refreshing, then enqueue-or-start" as one step
    state: Mutex<RefreshState>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        context: Arc<AuthSessionContext>,
        refresher: Arc<dyn TokenRefresher>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            context,
            refresher,
            refresh_timeout,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Whether a refresh round is running
    pub fn is_refreshing(&self) -> bool {
        self.lock_state().refreshing
    }

    /// Number of requests waiting on the current round or its follow-up
    pub fn pending_len(&self) -> usize {
        let state = self.lock_state();
        state.queue.len() + state.next_round.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        // Never held across an await; a poisoned guard still holds a usable queue
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request that `client` sent with `sent_with` and that was
    /// rejected with 401, then wait for its replay or rejection
    pub async fn submit(
        self: &Arc<Self>,
        client: &Client,
        request: Request,
        sent_with: Credential,
    ) -> Result<Response, ApiError> {
        let (reply, rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        enum Action {
            Queued { start_round: bool },
            ReplayNow(Request, String),
            Expired,
        }

        let action = {
            let mut state = self.lock_state();
            let current = self.context.read(|snapshot| snapshot.credential());
            let pending = PendingRequest {
                id: id.clone(),
                request,
                client: client.clone(),
                generation: sent_with.generation,
                reply,
            };

            match current {
                None => Action::Expired,
                // Signed in again since the request was sent; its token belonged to another session
                Some(current) if current.generation != sent_with.generation => {
                    tracing::info!(request_id = %id, "Request predates the current sign-in, not replaying");
                    Action::Expired
                }
                Some(_) if state.refreshing => {
                    if state.renewed.as_deref() == Some(sent_with.access_token.as_str()) {
                        tracing::debug!(request_id = %id, "Renewed token rejected, deferring to a follow-up round");
                        state.next_round.push_back(pending);
                    } else {
                        state.queue.push_back(pending);
                        tracing::debug!(request_id = %id, pending = state.queue.len(), "Queued request behind running token refresh");
                    }
                    Action::Queued { start_round: false }
                }
                // A finished round already replaced the token this request carried
                Some(current) if current.access_token != sent_with.access_token => {
                    Action::ReplayNow(pending.request, current.access_token)
                }
                Some(_) => {
                    state.refreshing = true;
                    state.queue.push_back(pending);
                    Action::Queued { start_round: true }
                }
            }
        };

        match action {
            Action::Expired => return Err(ApiError::SessionExpired),
            Action::ReplayNow(request, token) => {
                return self.replay(client, &id, request, &token).await
            }
            Action::Queued { start_round: true } => {
                tracing::info!(request_id = %id, "Starting token refresh round");
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.run_round().await });
            }
            Action::Queued { start_round: false } => {}
        }

        rx.await.unwrap_or_else(|_| {
            Err(ApiError::Internal(anyhow::anyhow!(
                "token refresh round ended without resolving request"
            )))
        })
    }

    /// Refresh rounds: renew once, then drain or reject the queue. Runs again
    /// while requests carrying the freshly renewed token keep being rejected.
    async fn run_round(self: Arc<Self>) {
        loop {
            match self.context.begin_refresh_with_generation().await {
                Ok((current, generation)) => {
                    if let Err(e) = self.renew(&current).await {
                        tracing::warn!(error = %e, "Token refresh failed, signing out");
                        // A newer sign-in is left alone
                        self.context.expire(generation).await;
                        self.reject_all();
                        return;
                    }
                    tracing::info!(pending = self.pending_len(), "Token refresh succeeded, replaying queued requests");
                }
                Err(TransitionError::AlreadyRefreshing) => {
                    tracing::info!("Session is already being refreshed, waiting for that outcome");
                    if self.context.wait_for_refresh(self.refresh_timeout).await.is_none() {
                        self.reject_all();
                        return;
                    }
                }
                Err(e) => {
                    tracing::info!(error = %e, "No session to refresh");
                    self.reject_all();
                    return;
                }
            }

            if !self.drain().await {
                return;
            }
            tracing::info!("Renewed token was rejected too, starting a follow-up refresh round");
        }
    }

    async fn renew(&self, current: &Session) -> Result<(), ApiError> {
        let session = match tokio::time::timeout(
            self.refresh_timeout,
            self.refresher.refresh(&current.refresh_token),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ApiError::Network {
                    kind: "timeout",
                    message: format!(
                        "token refresh did not respond within {:?}",
                        self.refresh_timeout
                    ),
                })
            }
        };

        // Recorded before publishing, so no request can carry it unnoticed
        self.lock_state().renewed = Some(session.access_token.clone());
        self.context.complete_refresh(session).await
    }

    /// Replay queued requests in arrival order until the queue is empty.
    /// Late arrivals joining during the drain are replayed in the same pass.
    /// Returns whether a follow-up round is needed.
    async fn drain(&self) -> bool {
        loop {
            let pending = {
                let mut state = self.lock_state();
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        state.renewed = None;
                        if state.next_round.is_empty() {
                            state.refreshing = false;
                            return false;
                        }
                        state.queue = std::mem::take(&mut state.next_round);
                        return true;
                    }
                }
            };

            let result = match self.context.current_credential() {
                Some(current) if current.generation == pending.generation => {
                    self.replay(&pending.client, &pending.id, pending.request, &current.access_token)
                        .await
                }
                // Signed out or signed in again during the drain
                _ => {
                    tracing::debug!(request_id = %pending.id, "Session gone before replay");
                    Err(ApiError::SessionExpired)
                }
            };

            if pending.reply.send(result).is_err() {
                tracing::debug!(request_id = %pending.id, "Caller abandoned request, dropping replay result");
            }
        }
    }

    /// Reject every queued request and end the round in one step
    fn reject_all(&self) {
        let queue: Vec<PendingRequest> = {
            let mut state = self.lock_state();
            state.refreshing = false;
            state.renewed = None;
            let mut queue = std::mem::take(&mut state.queue);
            queue.append(&mut state.next_round);
            queue.into()
        };

        tracing::info!(rejected = queue.len(), "Rejecting queued requests with SessionExpired");
        for pending in queue {
            let _ = pending.reply.send(Err(ApiError::SessionExpired));
        }
    }

    /// Re-issue a request once with `token`. Any failure, including another
    /// 401, is surfaced as is; a replay never starts a new round.
    async fn replay(
        &self,
        client: &Client,
        id: &str,
        mut request: Request,
        token: &str,
    ) -> Result<Response, ApiError> {
        attach_token(&mut request, token)?;
        tracing::debug!(request_id = %id, url = %request.url(), "Replaying request with renewed token");

        match execute(client, request).await? {
            Classified::Success(response) => Ok(response),
            Classified::AuthorizationFailure(response) => {
                tracing::warn!(request_id = %id, "Replayed request rejected again, not refreshing twice");
                Err(ApiError::from_response(response).await)
            }
            Classified::OtherFailure(response) => Err(ApiError::from_response(response).await),
        }
    }
}
