use crate::application::route_guard::Navigator;
use crate::application::session::SessionManager;
use crate::domain::models::{OAuthProvider, Route};
use crate::infrastructure::auth_client::{AuthClient, SignUpOutcome};
use crate::infrastructure::credential_store::CredentialStore;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

pub const CONFIRMATION_SENT_MESSAGE: &str = "Check your email for a confirmation link!";
pub const DEFAULT_SPLASH_DURATION: Duration = Duration::from_millis(2_500);

/// Intro screen shown before the unauthenticated forms.
#[derive(Debug)]
pub struct SplashScreen {
    duration: Duration,
    dismissed: Notify,
}

impl Default for SplashScreen {
    fn default() -> Self {
        Self::new(DEFAULT_SPLASH_DURATION)
    }
}

impl SplashScreen {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            dismissed: Notify::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Completes once the duration elapses or "Get Started" is pressed, whichever
    /// comes first.
    pub async fn wait(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = self.dismissed.notified() => {}
        }
    }

    pub fn get_started(&self) {
        // notify_one stores a permit, so pressing before wait() still counts.
        self.dismissed.notify_one();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors {
    pub email: Option<String>,
    pub password: Option<String>,
    pub confirm_password: Option<String>,
}

impl FieldErrors {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.password.is_none() && self.confirm_password.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub errors: FieldErrors,
    /// Backend rejection shown above the form.
    pub error: Option<String>,
    pub message: Option<String>,
    pub is_submitting: bool,
}

pub fn validate_sign_up(
    email: &str,
    password: &str,
    confirm_password: &str,
    min_password_length: usize,
) -> FieldErrors {
    let email = email.trim();
    let mut errors = FieldErrors::default();
    if email.is_empty() {
        errors.email = Some("Email is required".to_string());
    } else if !email.contains('@') {
        errors.email = Some("Enter a valid email address".to_string());
    }
    if password.chars().count() < min_password_length {
        errors.password = Some(format!(
            "Password must be at least {min_password_length} characters"
        ));
    }
    if confirm_password != password {
        errors.confirm_password = Some("Passwords do not match".to_string());
    }
    errors
}

pub struct SignUpView<S, C, N>
where
    S: CredentialStore,
    C: AuthClient,
    N: Navigator,
{
    sessions: Arc<SessionManager<S, C>>,
    navigator: Arc<N>,
    redirect_to: Option<String>,
    min_password_length: usize,
    form: Mutex<SignUpForm>,
}

impl<S, C, N> SignUpView<S, C, N>
where
    S: CredentialStore,
    C: AuthClient,
    N: Navigator,
{
    pub fn new(
        sessions: Arc<SessionManager<S, C>>,
        navigator: Arc<N>,
        redirect_to: Option<String>,
        min_password_length: usize,
    ) -> Self {
        Self {
            sessions,
            navigator,
            redirect_to,
            min_password_length,
            form: Mutex::new(SignUpForm::default()),
        }
    }

    pub fn snapshot(&self) -> SignUpForm {
        lock(&self.form).clone()
    }

    pub fn set_email(&self, value: impl Into<String>) {
        let mut form = lock(&self.form);
        form.email = value.into();
        form.errors.email = None;
    }

    pub fn set_password(&self, value: impl Into<String>) {
        let mut form = lock(&self.form);
        form.password = value.into();
        form.errors.password = None;
    }

    pub fn set_confirm_password(&self, value: impl Into<String>) {
        let mut form = lock(&self.form);
        form.confirm_password = value.into();
        form.errors.confirm_password = None;
    }

    /// Returns `true` when the service accepted the registration.
    pub async fn submit(&self) -> bool {
        let (email, password) = {
            let mut form = lock(&self.form);
            if form.is_submitting {
                return false;
            }
            let errors = validate_sign_up(
                &form.email,
                &form.password,
                &form.confirm_password,
                self.min_password_length,
            );
            form.error = None;
            form.message = None;
            if !errors.is_empty() {
                form.errors = errors;
                return false;
            }
            form.errors = FieldErrors::default();
            form.is_submitting = true;
            (form.email.trim().to_string(), form.password.clone())
        };

        let result = self
            .sessions
            .sign_up(&email, &password, self.redirect_to.clone())
            .await;

        let mut form = lock(&self.form);
        form.is_submitting = false;
        match result {
            Ok(SignUpOutcome::ConfirmationRequired(_)) => {
                form.message = Some(CONFIRMATION_SENT_MESSAGE.to_string());
                form.password.clear();
                form.confirm_password.clear();
                true
            }
            Ok(SignUpOutcome::SignedIn(_)) => {
                drop(form);
                self.navigator.replace(Route::Dashboard);
                true
            }
            Err(error) => {
                warn!(error = %error, "sign-up rejected");
                form.error = Some(error.user_message());
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignInForm {
    pub email: String,
    pub password: String,
    pub show_password: bool,
    pub error: Option<String>,
    pub is_submitting: bool,
}

pub struct SignInView<S, C, N>
where
    S: CredentialStore,
    C: AuthClient,
    N: Navigator,
{
    sessions: Arc<SessionManager<S, C>>,
    navigator: Arc<N>,
    callback_url: String,
    provider: OAuthProvider,
    form: Mutex<SignInForm>,
}

impl<S, C, N> SignInView<S, C, N>
where
    S: CredentialStore,
    C: AuthClient,
    N: Navigator,
{
    /// `callback_url` is the absolute URL of the callback route the provider
    /// redirects back to.
    pub fn new(sessions: Arc<SessionManager<S, C>>, navigator: Arc<N>, callback_url: String) -> Self {
        Self {
            sessions,
            navigator,
            callback_url,
            provider: OAuthProvider::Google,
            form: Mutex::new(SignInForm::default()),
        }
    }

    /// Provider behind the single social sign-in button.
    pub fn with_provider(mut self, provider: OAuthProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn provider(&self) -> &OAuthProvider {
        &self.provider
    }

    pub fn snapshot(&self) -> SignInForm {
        lock(&self.form).clone()
    }

    pub fn set_email(&self, value: impl Into<String>) {
        lock(&self.form).email = value.into();
    }

    pub fn set_password(&self, value: impl Into<String>) {
        lock(&self.form).password = value.into();
    }

    pub fn toggle_show_password(&self) -> bool {
        let mut form = lock(&self.form);
        form.show_password = !form.show_password;
        form.show_password
    }

    pub async fn submit(&self) -> bool {
        let (email, password) = {
            let mut form = lock(&self.form);
            if form.is_submitting {
                return false;
            }
            form.error = None;
            if form.email.trim().is_empty() || form.password.is_empty() {
                form.error = Some("Email and password are required".to_string());
                return false;
            }
            form.is_submitting = true;
            (form.email.trim().to_string(), form.password.clone())
        };

        let result = self.sessions.sign_in_with_password(&email, &password).await;

        let mut form = lock(&self.form);
        form.is_submitting = false;
        match result {
            Ok(_) => {
                form.password.clear();
                drop(form);
                info!("signed in with password");
                self.navigator.replace(Route::Dashboard);
                true
            }
            Err(error) => {
                warn!(error = %error, "sign-in rejected");
                form.error = Some(error.user_message());
                false
            }
        }
    }

    /// URL of the provider consent page. `None` when it could not be built; the
    /// reason is in the form error.
    pub fn sign_in_with_oauth(&self, provider: &OAuthProvider) -> Option<String> {
        match self.sessions.sign_in_with_oauth(provider, &self.callback_url) {
            Ok(url) => Some(url),
            Err(error) => {
                lock(&self.form).error = Some(error.user_message());
                None
            }
        }
    }

    pub fn sign_in_with_configured_provider(&self) -> Option<String> {
        self.sign_in_with_oauth(&self.provider)
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::route_guard::MemoryNavigator;
    use crate::domain::models::User;
    use crate::infrastructure::auth_client::InMemoryAuthClient;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;

    type Sessions = SessionManager<InMemoryCredentialStore, InMemoryAuthClient>;

    fn sessions_with(client: InMemoryAuthClient) -> Arc<Sessions> {
        Arc::new(SessionManager::new(
            Arc::new(InMemoryCredentialStore::default()),
            Arc::new(client),
        ))
    }

    fn ada() -> User {
        User {
            id: "user-ada".to_string(),
            email: Some("ada@example.com".to_string()),
        }
    }

    #[test]
    fn sign_up_validation_reports_each_field() {
        let errors = validate_sign_up("", "abc", "abd", 6);
        assert_eq!(errors.email.as_deref(), Some("Email is required"));
        assert_eq!(
            errors.password.as_deref(),
            Some("Password must be at least 6 characters")
        );
        assert_eq!(errors.confirm_password.as_deref(), Some("Passwords do not match"));

        let errors = validate_sign_up("ada.example.com", "secret1", "secret1", 6);
        assert!(errors.email.is_some());
        assert!(errors.password.is_none());

        assert!(validate_sign_up(" ada@example.com ", "secret1", "secret1", 6).is_empty());
    }

    #[tokio::test]
    async fn invalid_sign_up_is_not_sent() {
        let sessions = sessions_with(InMemoryAuthClient::default());
        let view = SignUpView::new(
            Arc::clone(&sessions),
            Arc::new(MemoryNavigator::default()),
            None,
            6,
        );
        view.set_email("ada@example.com");
        view.set_password("short");
        view.set_confirm_password("short");

        assert!(!view.submit().await);

        let form = view.snapshot();
        assert!(form.errors.password.is_some());
        assert!(form.message.is_none());
        let sign_in = sessions.sign_in_with_password("ada@example.com", "short").await;
        assert!(sign_in.is_err());
    }

    #[tokio::test]
    async fn sign_up_shows_confirmation_message() {
        let sessions = sessions_with(InMemoryAuthClient::default());
        let navigator = Arc::new(MemoryNavigator::new(Route::SignUp));
        let view = SignUpView::new(
            sessions,
            Arc::clone(&navigator),
            Some("http://localhost:3000/auth/callback".to_string()),
            6,
        );
        view.set_email("ada@example.com");
        view.set_password("secret1");
        view.set_confirm_password("secret1");

        assert!(view.submit().await);

        let form = view.snapshot();
        assert_eq!(form.message.as_deref(), Some(CONFIRMATION_SENT_MESSAGE));
        assert!(form.password.is_empty());
        assert!(!form.is_submitting);
        assert_eq!(navigator.current(), Route::SignUp);
    }

    #[tokio::test]
    async fn auto_confirmed_sign_up_goes_to_dashboard() {
        let sessions = sessions_with(InMemoryAuthClient::auto_confirming());
        let navigator = Arc::new(MemoryNavigator::new(Route::SignUp));
        let view = SignUpView::new(Arc::clone(&sessions), Arc::clone(&navigator), None, 6);
        view.set_email("ada@example.com");
        view.set_password("secret1");
        view.set_confirm_password("secret1");

        assert!(view.submit().await);

        assert_eq!(navigator.current(), Route::Dashboard);
        assert!(sessions.snapshot().user.is_some());
    }

    #[tokio::test]
    async fn duplicate_sign_up_shows_backend_message() {
        let sessions = sessions_with(InMemoryAuthClient::default().with_account(ada(), "secret1"));
        let view = SignUpView::new(sessions, Arc::new(MemoryNavigator::default()), None, 6);
        view.set_email("ada@example.com");
        view.set_password("secret1");
        view.set_confirm_password("secret1");

        assert!(!view.submit().await);

        assert_eq!(view.snapshot().error.as_deref(), Some("User already registered"));
    }

    #[tokio::test]
    async fn sign_in_replaces_route_with_dashboard() {
        let sessions = sessions_with(InMemoryAuthClient::default().with_account(ada(), "secret1"));
        sessions.initialize().await;
        let navigator = Arc::new(MemoryNavigator::new(Route::SignIn));
        let view = SignInView::new(
            Arc::clone(&sessions),
            Arc::clone(&navigator),
            "http://localhost:3000/auth/callback".to_string(),
        );
        view.set_email("ada@example.com");
        view.set_password("secret1");

        assert!(view.submit().await);

        assert_eq!(navigator.history(), vec![Route::Dashboard]);
        let state = sessions.snapshot();
        assert!(!state.loading);
        assert_eq!(state.user.map(|user| user.id), Some("user-ada".to_string()));
        assert!(view.snapshot().password.is_empty());
    }

    #[tokio::test]
    async fn wrong_password_shows_error_and_stays() {
        let sessions = sessions_with(InMemoryAuthClient::default().with_account(ada(), "secret1"));
        let navigator = Arc::new(MemoryNavigator::new(Route::SignIn));
        let view = SignInView::new(sessions, Arc::clone(&navigator), String::new());
        view.set_email("ada@example.com");
        view.set_password("wrong");

        assert!(!view.submit().await);

        let form = view.snapshot();
        assert_eq!(form.error.as_deref(), Some("Invalid login credentials"));
        assert!(!form.is_submitting);
        assert_eq!(navigator.current(), Route::SignIn);
    }

    #[tokio::test]
    async fn oauth_button_targets_callback_route() {
        let sessions = sessions_with(InMemoryAuthClient::default());
        let view = SignInView::new(
            sessions,
            Arc::new(MemoryNavigator::new(Route::SignIn)),
            "http://localhost:3000/auth/callback".to_string(),
        );
        assert!(view.toggle_show_password());

        let url = view
            .sign_in_with_oauth(&OAuthProvider::Github)
            .expect("authorize url");

        assert!(url.contains("provider=github"));
        assert!(url.contains("redirect_to=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fcallback"));
    }

    #[tokio::test]
    async fn provider_button_uses_the_configured_provider() {
        let default_view = SignInView::new(
            sessions_with(InMemoryAuthClient::default()),
            Arc::new(MemoryNavigator::new(Route::SignIn)),
            String::new(),
        );
        assert_eq!(default_view.provider(), &OAuthProvider::Google);

        let view = SignInView::new(
            sessions_with(InMemoryAuthClient::default()),
            Arc::new(MemoryNavigator::new(Route::SignIn)),
            "http://localhost:3000/auth/callback".to_string(),
        )
        .with_provider(OAuthProvider::Github);

        let url = view.sign_in_with_configured_provider().expect("authorize url");

        assert!(url.contains("provider=github"));
        assert!(view.snapshot().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn splash_finishes_after_duration() {
        let splash = SplashScreen::default();
        let started = tokio::time::Instant::now();
        splash.wait().await;
        assert!(started.elapsed() >= DEFAULT_SPLASH_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn get_started_skips_the_splash() {
        let splash = SplashScreen::default();
        let started = tokio::time::Instant::now();
        splash.get_started();
        splash.wait().await;
        assert!(started.elapsed() < DEFAULT_SPLASH_DURATION);
    }
}
