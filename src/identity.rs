// src/identity.rs

use crate::cache::{ResourceKey, TokenCache, TokenRecord};
use crate::codec::IdToken;
use crate::config::{Config, EndpointVersion};
use crate::error::KurveError;
use crate::request::{
    authorize_url, logout_url, AuthRequest, AuthRequestState, Grant, LoginHints, Prompt, ProviderResponse,
    RequestCorrelation,
};
use crate::scheduler::RenewalScheduler;
use crate::store::now_secs;
use crate::transport::{
    BrowserRedirect, BrowserSilentIframe, Navigator, NodeAuthorizationCodeExchange, RedirectTransport, SilentFrame,
    TransportOutcome,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Where an [`Identity`] is in its login lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    /// An interactive login is waiting for its callback.
    LoginPending,
    Authenticated,
    /// Authenticated, with a scheduled silent renewal in flight.
    RenewPending,
}

impl LoginState {
    fn is_authenticated(self) -> bool {
        matches!(self, LoginState::Authenticated | LoginState::RenewPending)
    }
}

/// Per-login overrides.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// B2C policy, overriding the configured one.
    pub policy: Option<String>,
    /// Tenant, overriding the configured one.
    pub tenant: Option<String>,
    /// Extra scopes to consent to at login (v2).
    pub scopes: Option<Vec<String>>,
    /// Resource for the login's access token (v1).
    pub resource: Option<String>,
}

/// Published when the scheduled silent renewal completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEvent {
    Renewed { expires_at: u64 },
    /// The identity stays authenticated; the host decides whether to prompt.
    Failed { message: String, interaction_required: bool },
}

/// An inbound server-side request on the redirect URI.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    response: ProviderResponse,
}

impl CallbackRequest {
    /// From a request target such as `/callback?code=...&state=...` or a full URL.
    pub fn from_uri(uri: &str) -> Result<Self, KurveError> {
        let query = uri
            .split_once('?')
            .map(|(_, query)| query.split('#').next().unwrap_or_default())
            .unwrap_or_default();
        Ok(Self {
            response: ProviderResponse::from_redirect(query)?,
        })
    }

    /// From an `application/x-www-form-urlencoded` body (`response_mode=form_post`).
    pub fn from_form(body: &str) -> Result<Self, KurveError> {
        Ok(Self {
            response: ProviderResponse::from_redirect(body)?,
        })
    }

    fn is_empty(&self) -> bool {
        let r = &self.response;
        r.code.is_none() && r.error.is_none() && r.id_token.is_none() && r.access_token.is_none()
    }
}

/// How the host should answer an inbound server-side request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCallback {
    /// The principal is signed in; serve the request.
    Authenticated,
    /// Send the user agent to this authorization URL.
    Redirect(Url),
}

type Completion = oneshot::Sender<Result<(), KurveError>>;
type CompletionReceiver = oneshot::Receiver<Result<(), KurveError>>;

/// A completed silent acquisition.
#[derive(Clone)]
struct Acquired {
    record: TokenRecord,
    /// Expiry of the ID token returned alongside, when there was one.
    id_token_expiry: Option<u64>,
}

/// The silent request in flight for one key, and the callers waiting on it.
struct InFlight {
    state: String,
    waiters: Vec<oneshot::Sender<Result<Acquired, KurveError>>>,
}

/// Clears a key's in-flight entry if the owning caller goes away before it
/// settles. Dropped waiters then see `StaleResponse`.
struct InFlightGuard<'a> {
    inner: &'a Inner,
    key: &'a ResourceKey,
    state: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut session = self.inner.session.lock();
        if session
            .silent
            .get(self.key)
            .is_some_and(|in_flight| in_flight.state == self.state)
        {
            session.silent.remove(self.key);
        }
    }
}

enum SilentStart {
    Send(AuthRequest),
    Join(oneshot::Receiver<Result<Acquired, KurveError>>),
}

struct PendingLogin {
    request: AuthRequestState,
    /// Resolves the `login_async` future waiting on this request, if any.
    completion: Option<Completion>,
    resume: LoginState,
}

struct Session {
    state: LoginState,
    pending: Option<PendingLogin>,
    id_token: Option<IdToken>,
    /// Key of the token obtained at login; the scheduler renews this one.
    root_key: ResourceKey,
    /// Silent request in flight per key. Responses for anything else are stale.
    silent: HashMap<ResourceKey, InFlight>,
    refresh_token: Option<String>,
}

struct Inner {
    config: Config,
    cache: TokenCache,
    correlation: RequestCorrelation,
    interactive: Arc<dyn RedirectTransport>,
    silent: Arc<dyn RedirectTransport>,
    scheduler: RenewalScheduler,
    session: Mutex<Session>,
    events: broadcast::Sender<RenewalEvent>,
}

/// The identity of one signed-in principal: login, callback handling,
/// token cache and silent renewal.
///
/// Cloning is cheap and clones share state. Renewal timers are spawned on
/// the ambient tokio runtime.
#[derive(Clone)]
pub struct Identity {
    inner: Arc<Inner>,
}

impl Identity {
    pub fn new(config: Config, interactive: Arc<dyn RedirectTransport>, silent: Arc<dyn RedirectTransport>) -> Self {
        let (events, _) = broadcast::channel(16);
        let inner = Inner {
            cache: TokenCache::new(config.store.clone(), Uuid::new_v4().simple().to_string()),
            correlation: RequestCorrelation::new(config.store.clone()),
            scheduler: RenewalScheduler::new(config.renewal_skew),
            session: Mutex::new(Session {
                state: LoginState::Unauthenticated,
                pending: None,
                id_token: None,
                root_key: config.root_key(),
                silent: HashMap::new(),
                refresh_token: None,
            }),
            interactive,
            silent,
            events,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// A browser-hosted identity: top-level redirects for login, a hidden frame for renewal.
    pub fn browser(config: Config, navigator: Arc<dyn Navigator>, frame: Arc<dyn SilentFrame>) -> Self {
        Self::new(
            config,
            Arc::new(BrowserRedirect::new(navigator)),
            Arc::new(BrowserSilentIframe::new(frame)),
        )
    }

    /// A server-side identity using the authorization code flow.
    pub fn node(config: Config) -> Result<Self, KurveError> {
        let exchange = Arc::new(NodeAuthorizationCodeExchange::new(config.clone())?);
        Ok(Self::new(config, exchange.clone(), exchange))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Identifies this identity's entries in a shared token store.
    pub fn session_id(&self) -> &str {
        self.inner.cache.namespace()
    }

    pub fn login_state(&self) -> LoginState {
        self.inner.session.lock().state
    }

    /// Subscribes to the outcomes of scheduled renewals.
    pub fn renewal_events(&self) -> broadcast::Receiver<RenewalEvent> {
        self.inner.events.subscribe()
    }

    /// Starts an interactive login and resolves once its callback has been handled.
    ///
    /// Fails immediately with [`KurveError::LoginAlreadyInProgress`] while
    /// another login is pending.
    #[instrument(skip(self), err)]
    pub async fn login_async(&self, options: LoginOptions) -> Result<(), KurveError> {
        let (request, url, completion) = self.begin_login(options, true)?;
        let auth_request = AuthRequest {
            state: request,
            url,
            grant: None,
        };
        match self.inner.interactive.initiate(&auth_request).await {
            Ok(TransportOutcome::Navigated(_)) => match completion {
                Some(receiver) => receiver.await.unwrap_or(Err(KurveError::LoginCancelled)),
                None => Err(KurveError::LoginCancelled),
            },
            Ok(TransportOutcome::Response(mut response)) => {
                response.state.get_or_insert_with(|| auth_request.state.state.clone());
                self.complete_login(response)
            }
            Err(e) => {
                self.abandon_login(&auth_request.state.state);
                Err(e)
            }
        }
    }

    /// Callback form of [`login_async`](Self::login_async).
    pub fn login<F>(&self, options: LoginOptions, callback: F)
    where
        F: FnOnce(Result<(), KurveError>) + Send + 'static,
    {
        let identity = self.clone();
        tokio::spawn(async move { callback(identity.login_async(options).await) });
    }

    /// Handles the redirect back from the provider in client mode.
    ///
    /// `fragment` is the URL fragment (`#id_token=...&state=...`) or the
    /// full redirect URL.
    pub async fn handle_callback(&self, fragment: &str) -> Result<(), KurveError> {
        match ProviderResponse::from_redirect(fragment) {
            Ok(response) => self.complete_login(response),
            Err(e) => Err(self.fail_login(e)),
        }
    }

    /// Handles an inbound request in node mode.
    ///
    /// A request carrying `code` and `state` is redeemed at the token
    /// endpoint. A request carrying nothing either proves an existing session
    /// or starts a login and asks the host to redirect.
    #[instrument(skip(self, request), err)]
    pub async fn handle_node_callback(&self, request: &CallbackRequest) -> Result<NodeCallback, KurveError> {
        if request.is_empty() {
            if self.is_logged_in() {
                return Ok(NodeCallback::Authenticated);
            }
            let (_, url, _) = self.begin_login(LoginOptions::default(), false)?;
            return Ok(NodeCallback::Redirect(url));
        }

        let response = &request.response;
        let Some(code) = response.code.clone() else {
            self.complete_login(response.clone())?;
            return Ok(NodeCallback::Authenticated);
        };
        if let Some(error) = response.error(None) {
            return Err(self.fail_login(error));
        }
        let Some(pending) = response.state.as_deref().and_then(|s| self.inner.correlation.peek(s)) else {
            return Err(self.fail_login(KurveError::StateMismatch));
        };

        let auth_request = AuthRequest {
            url: authorize_url(&self.inner.config, &pending, &LoginHints::default())?,
            state: pending,
            grant: Some(Grant::AuthorizationCode(code)),
        };
        match self.inner.interactive.initiate(&auth_request).await {
            Ok(TransportOutcome::Response(mut token_response)) => {
                token_response.state = Some(auth_request.state.state.clone());
                self.complete_login(token_response)?;
                Ok(NodeCallback::Authenticated)
            }
            Ok(TransportOutcome::Navigated(_)) => Err(self.fail_login(KurveError::UnexpectedNavigation)),
            Err(e) => Err(self.fail_login(e)),
        }
    }

    /// Returns an access token for `key`, from the cache when it is still
    /// valid, otherwise through a silent request.
    ///
    /// Fails immediately with [`KurveError::NotAuthenticated`] before login.
    /// A silent request that needs the user fails with
    /// [`KurveError::InteractionRequired`].
    pub async fn get_access_token_async(&self, key: impl Into<ResourceKey>) -> Result<String, KurveError> {
        let key = key.into();
        if !self.login_state().is_authenticated() {
            return Err(KurveError::NotAuthenticated);
        }
        if let Some(record) = self.inner.cache.get(&key) {
            debug!("Token cache hit for {}", key);
            return Ok(record.raw_token);
        }
        debug!("Token cache miss for {}", key);
        self.acquire_silently(key).await.map(|acquired| acquired.record.raw_token)
    }

    /// Callback form of [`get_access_token_async`](Self::get_access_token_async).
    pub fn get_access_token<F>(&self, key: impl Into<ResourceKey>, callback: F)
    where
        F: FnOnce(Result<String, KurveError>) + Send + 'static,
    {
        let identity = self.clone();
        let key = key.into();
        tokio::spawn(async move { callback(identity.get_access_token_async(key).await) });
    }

    /// Access token for `scopes` (v2).
    pub async fn get_access_token_for_scopes_async<I, S>(&self, scopes: I) -> Result<String, KurveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.get_access_token_async(ResourceKey::scopes(scopes)).await
    }

    /// Signs out: forgets every token, cancels renewal and, in client mode,
    /// sends the user agent to the provider's logout endpoint. Calling it
    /// again changes nothing.
    pub fn log_out(&self) {
        let (previous, pending) = {
            let mut session = self.inner.session.lock();
            let previous = session.state;
            session.state = LoginState::Unauthenticated;
            session.id_token = None;
            session.silent.clear();
            session.refresh_token = None;
            (previous, session.pending.take())
        };
        self.inner.scheduler.cancel();
        self.inner.cache.clear();
        if let Some(pending) = pending {
            self.inner.correlation.discard(&pending.request.state);
            if let Some(completion) = pending.completion {
                let _ = completion.send(Err(KurveError::LoginCancelled));
            }
        }
        if previous == LoginState::Unauthenticated {
            return;
        }
        info!("Logged out");
        if !self.inner.config.is_node() {
            match logout_url(&self.inner.config) {
                Ok(url) => self.inner.interactive.sign_out(&url),
                Err(e) => warn!("Cannot build the logout URL: {}", e),
            }
        }
    }

    /// Whether the identity is authenticated with an unexpired ID token.
    pub fn is_logged_in(&self) -> bool {
        let session = self.inner.session.lock();
        session.state.is_authenticated()
            && session
                .id_token
                .as_ref()
                .and_then(|id_token| id_token.expiry)
                .is_some_and(|exp| exp > now_secs())
    }

    pub fn get_id_token(&self) -> Option<IdToken> {
        self.inner.session.lock().id_token.clone()
    }

    fn login_key(&self, options: &LoginOptions) -> ResourceKey {
        let config = &self.inner.config;
        match config.endpoint_version {
            EndpointVersion::V1 => {
                ResourceKey::resource(options.resource.clone().unwrap_or_else(|| config.default_resource.clone()))
            }
            EndpointVersion::V2 => ResourceKey::scopes(
                config
                    .default_scopes
                    .iter()
                    .chain(options.scopes.iter().flatten()),
            ),
        }
    }

    /// Creates and records the request for an interactive login, moving to `LoginPending`.
    fn begin_login(
        &self,
        options: LoginOptions,
        await_completion: bool,
    ) -> Result<(AuthRequestState, Url, Option<CompletionReceiver>), KurveError> {
        let config = &self.inner.config;
        if options.policy.is_some() && config.endpoint_version == EndpointVersion::V1 {
            return Err(KurveError::InvalidConfiguration(
                "B2C policies require the v2 endpoint".to_string(),
            ));
        }
        let mut session = self.inner.session.lock();
        if session.state == LoginState::LoginPending
            && session
                .pending
                .as_ref()
                .is_some_and(|pending| pending.request.expires_at > now_secs())
        {
            return Err(KurveError::LoginAlreadyInProgress);
        }

        let request = AuthRequestState::new(self.login_key(&options), Prompt::Interactive, config.request_ttl.as_secs())
            .with_tenant(options.tenant)
            .with_policy(options.policy);
        let url = authorize_url(config, &request, &LoginHints::default())?;
        self.inner.correlation.save(&request)?;

        let (sender, receiver) = if await_completion {
            let (sender, receiver) = oneshot::channel();
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        let resume = match session.state {
            LoginState::LoginPending => LoginState::Unauthenticated,
            other => other,
        };
        if let Some(stale) = session.pending.replace(PendingLogin {
            request: request.clone(),
            completion: sender,
            resume,
        }) {
            self.inner.correlation.discard(&stale.request.state);
        }
        session.state = LoginState::LoginPending;
        info!(state = %request.state, "Login started");
        Ok((request, url, receiver))
    }

    /// Restores the pre-login state after the transport failed to start the login.
    fn abandon_login(&self, state: &str) {
        let mut session = self.inner.session.lock();
        if session.pending.as_ref().is_some_and(|p| p.request.state == state) {
            if let Some(pending) = session.pending.take() {
                session.state = pending.resume;
            }
        }
        self.inner.correlation.discard(state);
    }

    /// Validates a login response and commits it, resolving the pending login either way.
    fn complete_login(&self, response: ProviderResponse) -> Result<(), KurveError> {
        let (request, records, id_token) = match self.accept_login(response) {
            Ok(accepted) => accepted,
            Err(e) => return Err(self.fail_login(e)),
        };
        for record in &records {
            if let Err(e) = self.inner.cache.set(record) {
                return Err(self.fail_login(e));
            }
        }

        let renew_at = records
            .iter()
            .map(|record| record.expires_at)
            .chain(id_token.expiry)
            .min();
        let completion = {
            let mut session = self.inner.session.lock();
            session.state = LoginState::Authenticated;
            session.root_key = request.resource_key.clone();
            session.refresh_token = records.iter().find_map(|record| record.refresh_token.clone());
            session.id_token = Some(id_token);
            match session.pending.take() {
                Some(pending) if pending.request.state == request.state => pending.completion,
                other => {
                    session.pending = other;
                    None
                }
            }
        };
        if let Some(renew_at) = renew_at {
            self.arm_renewal(renew_at);
        }
        info!(state = %request.state, "Login completed");
        if let Some(completion) = completion {
            let _ = completion.send(Ok(()));
        }
        Ok(())
    }

    /// Checks state, provider error and nonce, and decodes the tokens.
    fn accept_login(
        &self,
        response: ProviderResponse,
    ) -> Result<(AuthRequestState, Vec<TokenRecord>, IdToken), KurveError> {
        let Some(request) = response
            .state
            .as_deref()
            .and_then(|state| self.inner.correlation.take(state))
        else {
            warn!(state = ?response.state, "Callback state does not match a pending request");
            return Err(KurveError::StateMismatch);
        };
        if let Some(error) = response.error(None) {
            return Err(error);
        }

        let raw_id_token = response
            .id_token
            .ok_or_else(|| KurveError::MalformedToken("the response carries no id_token".to_string()))?;
        let id_token = IdToken::parse(&raw_id_token)?;
        if id_token.nonce.as_deref() != Some(request.nonce.as_str()) {
            warn!(state = %request.state, "ID token nonce does not match the request");
            return Err(KurveError::NonceMismatch);
        }

        let mut root = match response.access_token {
            Some(access_token) => {
                TokenRecord::from_token(access_token, request.resource_key.clone(), response.expires_in)?
            }
            None => TokenRecord::from_token(raw_id_token, request.resource_key.clone(), response.expires_in)?,
        };
        root.refresh_token = response.refresh_token;
        Ok((request, vec![root], id_token))
    }

    /// Fails the pending login: back to `Unauthenticated`, nothing retained.
    fn fail_login(&self, error: KurveError) -> KurveError {
        warn!("Login failed: {}", error);
        let pending = {
            let mut session = self.inner.session.lock();
            session.state = LoginState::Unauthenticated;
            session.id_token = None;
            session.silent.clear();
            session.refresh_token = None;
            session.pending.take()
        };
        self.inner.scheduler.cancel();
        if let Some(pending) = pending {
            self.inner.correlation.discard(&pending.request.state);
            if let Some(completion) = pending.completion {
                let _ = completion.send(Err(error.duplicate()));
            }
        }
        error
    }

    /// Requests a token for `key` without user interaction, bypassing the cache.
    ///
    /// A caller asking for a key that already has a request in flight waits
    /// for that request's result instead of sending another.
    #[instrument(skip(self, key), fields(key = %key), err)]
    async fn acquire_silently(&self, key: ResourceKey) -> Result<Acquired, KurveError> {
        let auth_request = match self.start_silent(&key)? {
            SilentStart::Send(auth_request) => auth_request,
            SilentStart::Join(receiver) => {
                debug!("Joining the silent request in flight for {}", key);
                return receiver.await.unwrap_or(Err(KurveError::StaleResponse));
            }
        };
        let request = &auth_request.state;
        let guard = InFlightGuard {
            inner: &self.inner,
            key: &key,
            state: &request.state,
        };

        let outcome = self.inner.silent.initiate(&auth_request).await;
        std::mem::forget(guard);

        let mut session = self.inner.session.lock();
        let current = session
            .silent
            .get(&key)
            .is_some_and(|in_flight| in_flight.state == request.state);
        if !session.state.is_authenticated() || !current {
            debug!(state = %request.state, "Discarding response for a superseded silent request");
            return Err(KurveError::StaleResponse);
        }
        let waiters = session
            .silent
            .remove(&key)
            .map(|in_flight| in_flight.waiters)
            .unwrap_or_default();
        let result = self.settle_silent(&mut session, &key, &auth_request, outcome);
        drop(session);

        for waiter in waiters {
            let shared = match &result {
                Ok(acquired) => Ok(acquired.clone()),
                Err(e) => Err(e.duplicate()),
            };
            let _ = waiter.send(shared);
        }
        result
    }

    fn start_silent(&self, key: &ResourceKey) -> Result<SilentStart, KurveError> {
        let config = &self.inner.config;
        let mut session = self.inner.session.lock();
        if !session.state.is_authenticated() {
            return Err(KurveError::NotAuthenticated);
        }
        if let Some(in_flight) = session.silent.get_mut(key) {
            let (sender, receiver) = oneshot::channel();
            in_flight.waiters.push(sender);
            return Ok(SilentStart::Join(receiver));
        }

        let hints = session
            .id_token
            .as_ref()
            .map(LoginHints::from_id_token)
            .unwrap_or_default();
        let request = AuthRequestState::new(key.clone(), Prompt::Silent, config.request_ttl.as_secs())
            .with_id_token(*key == session.root_key);
        let url = authorize_url(config, &request, &hints)?;
        let grant = if config.is_node() {
            session.refresh_token.clone().map(Grant::RefreshToken)
        } else {
            None
        };
        session.silent.insert(
            key.clone(),
            InFlight {
                state: request.state.clone(),
                waiters: Vec::new(),
            },
        );
        Ok(SilentStart::Send(AuthRequest {
            state: request,
            url,
            grant,
        }))
    }

    /// Validates a silent response and caches its token.
    fn settle_silent(
        &self,
        session: &mut Session,
        key: &ResourceKey,
        auth_request: &AuthRequest,
        outcome: Result<TransportOutcome, KurveError>,
    ) -> Result<Acquired, KurveError> {
        let request = &auth_request.state;
        let mut response = match outcome? {
            TransportOutcome::Response(response) => response,
            TransportOutcome::Navigated(_) => return Err(KurveError::UnexpectedNavigation),
        };
        if let Some(error) = response.error(None) {
            return Err(error);
        }
        if auth_request.grant.is_none() && response.state.as_deref() != Some(request.state.as_str()) {
            return Err(KurveError::StateMismatch);
        }

        let access_token = response
            .access_token
            .take()
            .ok_or_else(|| KurveError::MalformedToken("the response carries no access_token".to_string()))?;
        let mut record = TokenRecord::from_token(access_token, key.clone(), response.expires_in)?;
        record.refresh_token = response.refresh_token.clone();

        let renewed_id_token = match response.id_token.as_deref() {
            Some(raw) => {
                let id_token = IdToken::parse(raw)?;
                // Implicit-flow ID tokens echo our nonce; refresh-grant ones need not.
                if auth_request.grant.is_none() && id_token.nonce.as_deref() != Some(request.nonce.as_str()) {
                    return Err(KurveError::NonceMismatch);
                }
                Some(id_token)
            }
            None => None,
        };

        self.inner.cache.set(&record)?;
        if let Some(refresh_token) = response.refresh_token {
            session.refresh_token = Some(refresh_token);
        }
        let id_token_expiry = renewed_id_token.as_ref().and_then(|id_token| id_token.expiry);
        if let Some(id_token) = renewed_id_token {
            session.id_token = Some(id_token);
        }
        debug!("Silently acquired a token for {} until {}", key, record.expires_at);
        Ok(Acquired {
            record,
            id_token_expiry,
        })
    }

    fn arm_renewal(&self, expires_at: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.arm(expires_at, move || async move {
            if let Some(inner) = weak.upgrade() {
                Identity { inner }.renew().await;
            }
        });
    }

    /// Scheduled renewal of the login's own token.
    async fn renew(self) {
        let key = {
            let mut session = self.inner.session.lock();
            if session.state != LoginState::Authenticated {
                return;
            }
            session.state = LoginState::RenewPending;
            session.root_key.clone()
        };
        let result = self.acquire_silently(key.clone()).await;
        {
            let mut session = self.inner.session.lock();
            if session.state == LoginState::RenewPending {
                session.state = LoginState::Authenticated;
            }
        }
        match result {
            Ok(acquired) => {
                let renew_at = acquired
                    .id_token_expiry
                    .map_or(acquired.record.expires_at, |exp| exp.min(acquired.record.expires_at));
                self.arm_renewal(renew_at);
                let _ = self.inner.events.send(RenewalEvent::Renewed { expires_at: renew_at });
            }
            Err(KurveError::StaleResponse) => {
                if !self.login_state().is_authenticated() {
                    return;
                }
                if let Some(record) = self.inner.cache.get(&key) {
                    self.arm_renewal(record.expires_at);
                }
            }
            Err(e) => {
                warn!("Scheduled renewal failed: {}", e);
                let _ = self.inner.events.send(RenewalEvent::Failed {
                    message: e.to_string(),
                    interaction_required: e.is_interaction_required(),
                });
            }
        }
    }
}
