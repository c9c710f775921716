use crate::application::todos::SessionSource;
use crate::domain::models::{AuthEvent, AuthEventKind, OAuthProvider, Session, User};
use crate::infrastructure::auth_client::{
    parse_callback_url, AuthClient, AuthTokenResponse, CallbackParams, SignUpOutcome,
    SignUpRequest,
};
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const TOKEN_EXPIRY_LEEWAY_SECONDS: i64 = 60;
const EVENT_CHANNEL_CAPACITY: usize = 32;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type Listener = Arc<dyn Fn(&SessionState) + Send + Sync>;
type ListenerList = Mutex<Vec<(u64, Listener)>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user: Option<User>,
    pub session: Option<Session>,
    pub loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            loading: true,
        }
    }
}

/// Deregisters its listener when dropped.
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        if let Ok(mut listeners) = listeners.lock() {
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Owns the authentication session of this client instance.
///
/// State only changes by applying an [`AuthEvent`]; every applied event is
/// delivered to registered listeners (synchronously, in registration order) and
/// then published on the broadcast channel returned by [`SessionManager::subscribe`].
pub struct SessionManager<S, C>
where
    S: CredentialStore,
    C: AuthClient,
{
    credential_store: Arc<S>,
    auth_client: Arc<C>,
    state: Mutex<SessionState>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
    events: broadcast::Sender<AuthEvent>,
    now_provider: NowProvider,
}

impl<S, C> SessionManager<S, C>
where
    S: CredentialStore,
    C: AuthClient,
{
    pub fn new(credential_store: Arc<S>, auth_client: Arc<C>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            credential_store,
            auth_client,
            state: Mutex::new(SessionState::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            events,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Resolves the stored session and emits `INITIAL_SESSION`. A failed lookup is
    /// logged and resolved as signed out so that `loading` never stays set.
    pub async fn initialize(&self) -> Option<Session> {
        let session = match self.get_session().await {
            Ok(session) => session,
            Err(error) => {
                error!(error = %error, "failed to restore session; continuing signed out");
                None
            }
        };
        self.apply_event(AuthEvent::new(AuthEventKind::InitialSession, session.clone()));
        session
    }

    /// Returns the stored session, refreshing it first when the access token has
    /// expired. A refresh token the service rejects clears the stored session.
    pub async fn get_session(&self) -> Result<Option<Session>, InfraError> {
        let Some(stored) = self.credential_store.load_session()? else {
            return Ok(None);
        };
        if self.is_session_valid(&stored) {
            return Ok(Some(stored));
        }

        let Some(refresh_token) = stored.refresh_token.clone() else {
            self.credential_store.delete_session()?;
            return Ok(None);
        };
        match self.auth_client.refresh_session(&refresh_token).await {
            Ok(tokens) => {
                let session = self.session_from_tokens(tokens, Some(stored.user), stored.refresh_token);
                self.credential_store.save_session(&session)?;
                Ok(Some(session))
            }
            Err(error) if error.is_rejected_credential() => {
                warn!(error = %error, "stored refresh token rejected; discarding session");
                self.credential_store.delete_session()?;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        redirect_to: Option<String>,
    ) -> Result<SignUpOutcome, InfraError> {
        let outcome = self
            .auth_client
            .sign_up(SignUpRequest {
                email: email.to_string(),
                password: password.to_string(),
                redirect_to,
            })
            .await?;

        if let SignUpOutcome::SignedIn(tokens) = &outcome {
            self.establish(tokens.clone(), None, AuthEventKind::SignedIn).await?;
        } else {
            info!("sign-up accepted; confirmation email sent");
        }
        Ok(outcome)
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, InfraError> {
        let tokens = self.auth_client.sign_in_with_password(email, password).await?;
        self.establish(tokens, None, AuthEventKind::SignedIn).await
    }

    /// URL of the provider's consent page. The caller navigates there; the
    /// provider eventually redirects back to `redirect_to`.
    pub fn sign_in_with_oauth(&self, provider: &OAuthProvider, redirect_to: &str) -> Result<String, InfraError> {
        self.auth_client.authorize_url(provider, redirect_to)
    }

    /// Consumes the tokens the auth service appended to the callback URL.
    /// Returns `None` when the URL carries neither tokens nor an error.
    pub async fn complete_oauth_callback(&self, callback_url: &str) -> Result<Option<Session>, InfraError> {
        match parse_callback_url(callback_url)? {
            CallbackParams::Tokens(tokens) => {
                let session = self.establish(tokens, None, AuthEventKind::SignedIn).await?;
                Ok(Some(session))
            }
            CallbackParams::Error { code, description } => {
                warn!(code = %code, "auth callback returned an error");
                Err(InfraError::backend(description))
            }
            CallbackParams::Empty => Ok(None),
        }
    }

    pub async fn refresh(&self) -> Result<Session, InfraError> {
        let current = self
            .snapshot()
            .session
            .ok_or(InfraError::NotAuthenticated)?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| InfraError::Auth("session has no refresh token".to_string()))?;

        match self.auth_client.refresh_session(&refresh_token).await {
            Ok(tokens) => {
                self.establish(tokens, Some(current.user), AuthEventKind::TokenRefreshed)
                    .await
            }
            Err(error) if error.is_rejected_credential() => {
                warn!(error = %error, "refresh token rejected; signing out locally");
                self.credential_store.delete_session()?;
                self.apply_event(AuthEvent::new(AuthEventKind::SignedOut, None));
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// The current session with a valid access token. An expired token is
    /// refreshed first; an expired session that cannot be refreshed is signed
    /// out locally.
    pub async fn active_session(&self) -> Result<Session, InfraError> {
        let current = self
            .snapshot()
            .session
            .ok_or(InfraError::NotAuthenticated)?;
        if self.is_session_valid(&current) {
            return Ok(current);
        }
        if current.refresh_token.is_none() {
            warn!("session expired without a refresh token; signing out locally");
            self.credential_store.delete_session()?;
            self.apply_event(AuthEvent::new(AuthEventKind::SignedOut, None));
            return Err(InfraError::NotAuthenticated);
        }
        self.refresh().await
    }

    pub async fn access_token(&self) -> Result<String, InfraError> {
        Ok(self.active_session().await?.access_token)
    }

    pub async fn reload_user(&self) -> Result<User, InfraError> {
        let current = self
            .snapshot()
            .session
            .ok_or(InfraError::NotAuthenticated)?;
        let user = self.auth_client.get_user(&current.access_token).await?;
        let session = Session {
            user: user.clone(),
            ..current
        };
        self.credential_store.save_session(&session)?;
        self.apply_event(AuthEvent::new(AuthEventKind::UserUpdated, Some(session)));
        Ok(user)
    }

    /// Revokes the session with the auth service and then clears it locally by
    /// emitting `SIGNED_OUT`. A session the service no longer recognizes is still
    /// cleared; any other failure leaves the session in place.
    pub async fn sign_out(&self) -> Result<(), InfraError> {
        if let Some(session) = self.snapshot().session {
            match self.auth_client.sign_out(&session.access_token).await {
                Ok(()) => {}
                Err(InfraError::Backend {
                    status: Some(401 | 403 | 404),
                    message,
                }) => {
                    debug!(message = %message, "session already gone on the auth service");
                }
                Err(error) => {
                    error!(error = %error, "sign-out failed");
                    return Err(error);
                }
            }
        }

        self.credential_store.delete_session()?;
        self.apply_event(AuthEvent::new(AuthEventKind::SignedOut, None));
        info!("signed out");
        Ok(())
    }

    async fn establish(
        &self,
        tokens: AuthTokenResponse,
        known_user: Option<User>,
        kind: AuthEventKind,
    ) -> Result<Session, InfraError> {
        let user = match tokens.user.clone().or(known_user) {
            Some(user) => user,
            None => self.auth_client.get_user(&tokens.access_token).await?,
        };
        user.validate().map_err(InfraError::Auth)?;

        let fallback_refresh_token = self
            .snapshot()
            .session
            .filter(|session| session.user.id == user.id)
            .and_then(|session| session.refresh_token);
        let session = self.session_from_tokens(tokens, Some(user), fallback_refresh_token);
        self.credential_store.save_session(&session)?;
        self.apply_event(AuthEvent::new(kind, Some(session.clone())));
        info!(event = kind.as_str(), user_id = %session.user.id, "session established");
        Ok(session)
    }

    fn session_from_tokens(
        &self,
        tokens: AuthTokenResponse,
        known_user: Option<User>,
        fallback_refresh_token: Option<String>,
    ) -> Session {
        let expires_at = (self.now_provider)() + Duration::seconds(tokens.expires_in.max(0));
        let user = tokens
            .user
            .or(known_user)
            .unwrap_or_else(|| User {
                id: String::new(),
                email: None,
            });
        Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(fallback_refresh_token),
            expires_at,
            token_type: tokens.token_type.unwrap_or_else(|| "bearer".to_string()),
            user,
        }
    }

    fn is_session_valid(&self, session: &Session) -> bool {
        session.is_valid_at((self.now_provider)(), TOKEN_EXPIRY_LEEWAY_SECONDS)
    }

    fn apply_event(&self, event: AuthEvent) {
        let snapshot = {
            let mut state = self.lock_state();
            state.user = event.session.as_ref().map(|session| session.user.clone());
            state.session = event.session.clone();
            state.loading = false;
            state.clone()
        };
        debug!(event = event.kind.as_str(), signed_in = snapshot.user.is_some(), "auth state changed");

        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(&snapshot);
        }

        // No receivers is fine: nobody is on a view that listens right now.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<S, C> SessionSource for SessionManager<S, C>
where
    S: CredentialStore,
    C: AuthClient,
{
    async fn active_session(&self) -> Result<Session, InfraError> {
        SessionManager::active_session(self).await
    }

    fn current_user_id(&self) -> Option<String> {
        self.snapshot().user.map(|user| user.id)
    }
}
