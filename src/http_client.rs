use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    AuthSessionContext, HttpTokenRefresher, TokenRefreshCoordinator, TokenRefresher,
};
use crate::config::Config;
use crate::error::ApiError;

/// Status that marks the presented access token as rejected
pub(crate) const AUTHORIZATION_FAILURE: StatusCode = StatusCode::UNAUTHORIZED;

/// Raw response classification
pub(crate) enum Classified {
    Success(Response),
    AuthorizationFailure(Response),
    OtherFailure(Response),
}

impl Classified {
    pub(crate) fn from_response(response: Response) -> Self {
        let status = response.status();
        if status.is_success() {
            Classified::Success(response)
        } else if status == AUTHORIZATION_FAILURE {
            Classified::AuthorizationFailure(response)
        } else {
            Classified::OtherFailure(response)
        }
    }
}

/// Execute a request once and classify the result
pub(crate) async fn execute(client: &Client, request: Request) -> Result<Classified, ApiError> {
    let method = request.method().clone();
    let url = request.url().clone();

    match client.execute(request).await {
        Ok(response) => {
            tracing::debug!(method = %method, url = %url, status = %response.status(), "Received HTTP response");
            Ok(Classified::from_response(response))
        }
        Err(e) => {
            let err = ApiError::from_transport(&e);
            tracing::warn!(
                method = %method,
                url = %url,
                error = %err,
                "HTTP request error"
            );
            Err(err)
        }
    }
}

/// Set `Authorization: Bearer <token>` on the request
pub(crate) fn attach_token(request: &mut Request, token: &str) -> Result<(), ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .context("Access token is not a valid header value")?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// Timeouts used by the client and the refresh coordinator
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for HttpClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.http_connect_timeout),
            request_timeout: Duration::from_secs(config.http_request_timeout),
            refresh_timeout: Duration::from_secs(config.token_refresh_timeout),
        }
    }
}

/// HTTP client for the gym API with transparent token refresh
pub struct HttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    /// Session state, source of the access token
    context: Arc<AuthSessionContext>,

    /// Single-flight refresh protocol, shared with every client of `context`
    coordinator: Arc<TokenRefreshCoordinator>,
}

impl HttpClient {
    /// Create a client that refreshes through `POST /token/refresh`
    pub fn new(
        base_url: &str,
        context: Arc<AuthSessionContext>,
        options: HttpClientOptions,
    ) -> anyhow::Result<Self> {
        let client = build_client(&options)?;
        let refresher = Arc::new(HttpTokenRefresher::new(client.clone(), base_url));
        Ok(Self::assemble(client, base_url, context, refresher, &options))
    }

    pub fn from_config(config: &Config, context: Arc<AuthSessionContext>) -> anyhow::Result<Self> {
        Self::new(&config.api_base_url, context, HttpClientOptions::from(config))
    }

    /// Create a client with a custom credential-renewal implementation
    ///
    /// Clients on one context share a coordinator; the first client built for
    /// the context supplies its refresher and refresh timeout.
    pub fn with_refresher(
        base_url: &str,
        context: Arc<AuthSessionContext>,
        refresher: Arc<dyn TokenRefresher>,
        options: HttpClientOptions,
    ) -> anyhow::Result<Self> {
        let client = build_client(&options)?;
        Ok(Self::assemble(client, base_url, context, refresher, &options))
    }

    fn assemble(
        client: Client,
        base_url: &str,
        context: Arc<AuthSessionContext>,
        refresher: Arc<dyn TokenRefresher>,
        options: &HttpClientOptions,
    ) -> Self {
        let coordinator = context.coordinator_or_init(|| {
            TokenRefreshCoordinator::new(context.clone(), refresher, options.refresh_timeout)
        });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            context,
            coordinator,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start a request against an API path
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    pub fn context(&self) -> &Arc<AuthSessionContext> {
        &self.context
    }

    pub fn coordinator(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.coordinator
    }

    pub(crate) fn raw_client(&self) -> &Client {
        &self.client
    }

    /// Send an authenticated request
    ///
    /// A 401 on the first attempt is absorbed by the refresh coordinator: the
    /// request is either replayed with the renewed token or rejected with
    /// [`ApiError::SessionExpired`]. A replayed request is never refreshed again.
    pub async fn send(&self, mut request: Request) -> Result<Response, ApiError> {
        let credential = self.context.current_credential();
        let replay = request.try_clone();

        if let Some(ref credential) = credential {
            attach_token(&mut request, &credential.access_token)?;
        }

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            authenticated = credential.is_some(),
            "Sending HTTP request"
        );

        match execute(&self.client, request).await? {
            Classified::Success(response) => Ok(response),
            Classified::AuthorizationFailure(response) => match (credential, replay) {
                (Some(credential), Some(replay)) => {
                    tracing::warn!(url = %response.url(), "Received 401, routing request through token refresh");
                    self.coordinator.submit(&self.client, replay, credential).await
                }
                (Some(_), None) => {
                    tracing::warn!("Received 401 for a request whose body cannot be replayed");
                    Err(ApiError::from_response(response).await)
                }
                // Nothing to refresh: a credential check failed (e.g. wrong password)
                (None, _) => Err(ApiError::from_response(response).await),
            },
            Classified::OtherFailure(response) => Err(fail(response).await),
        }
    }

    /// Send without attaching credentials or entering the refresh protocol
    pub async fn send_unauthenticated(&self, request: Request) -> Result<Response, ApiError> {
        match execute(&self.client, request).await? {
            Classified::Success(response) => Ok(response),
            Classified::AuthorizationFailure(response) | Classified::OtherFailure(response) => {
                Err(fail(response).await)
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.build(self.request(Method::GET, path))?;
        decode_json(self.send(request).await?).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.build(self.request(Method::POST, path).json(body))?;
        decode_json(self.send(request).await?).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.build(self.request(Method::PUT, path).json(body))?;
        decode_json(self.send(request).await?).await
    }

    pub(crate) fn build(&self, builder: RequestBuilder) -> Result<Request, ApiError> {
        builder
            .build()
            .context("Failed to build request")
            .map_err(ApiError::Internal)
    }
}

fn build_client(options: &HttpClientOptions) -> anyhow::Result<Client> {
    Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.request_timeout)
        .build()
        .context("Failed to create HTTP client")
}

async fn fail(response: Response) -> ApiError {
    let status = response.status();
    let url = response.url().clone();
    let err = ApiError::from_response(response).await;
    tracing::error!(status = status.as_u16(), url = %url, error = %err, "HTTP request failed with error response");
    err
}

/// Decode a JSON body; an empty body decodes as `null`
pub async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::from_transport(&e))?;
    let bytes: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
    serde_json::from_slice(bytes).map_err(|e| ApiError::Decode(e.to_string()))
}
