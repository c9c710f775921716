use crate::application::forms::{SignInView, SignUpView, SplashScreen};
use crate::application::route_guard::{
    CallbackRedirector, GuardDecision, MemoryNavigator, Navigator, RedirectConfig, RouteGuard,
};
use crate::application::session::{ListenerGuard, SessionManager, SessionState};
use crate::application::todos::{SessionSource, TaskListController};
use crate::domain::models::Route;
use crate::infrastructure::auth_client::{AuthClient, ReqwestAuthClient};
use crate::infrastructure::config::{AppSettings, BackendConfig};
use crate::infrastructure::credential_store::{CredentialStore, KeyringCredentialStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::todo_store::{ReqwestTodoStore, TodoStore};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

const CREDENTIAL_ACCOUNT: &str = "default";

type TaskListSlot<T> = Arc<Mutex<Option<Arc<TaskListController<T>>>>>;

/// One running client: the session, the navigation stack and the task list of
/// the signed-in user.
///
/// Every session change is run through the route guard. The cached task list
/// belongs to one user and is dropped as soon as that user is no longer signed
/// in.
pub struct App<S, C, T>
where
    S: CredentialStore + 'static,
    C: AuthClient + 'static,
    T: TodoStore + 'static,
{
    settings: AppSettings,
    backend: BackendConfig,
    sessions: Arc<SessionManager<S, C>>,
    store: Arc<T>,
    navigator: Arc<MemoryNavigator>,
    route_guard: Arc<RouteGuard<MemoryNavigator>>,
    task_list: TaskListSlot<T>,
    _session_listener: ListenerGuard,
}

impl App<KeyringCredentialStore, ReqwestAuthClient, ReqwestTodoStore> {
    /// Wires the keychain and the hosted backend.
    pub fn connect(settings: AppSettings, backend: BackendConfig) -> Result<Self, InfraError> {
        let credentials = Arc::new(KeyringCredentialStore::new(
            settings.credential_service.clone(),
            CREDENTIAL_ACCOUNT,
        ));
        let auth_client = Arc::new(ReqwestAuthClient::new(&backend.url, backend.anon_key.clone())?);
        let store = Arc::new(ReqwestTodoStore::new(&backend.url, backend.anon_key.clone())?);
        let sessions = Arc::new(SessionManager::new(credentials, auth_client));
        Ok(Self::new(settings, backend, sessions, store))
    }
}

impl<S, C, T> App<S, C, T>
where
    S: CredentialStore + 'static,
    C: AuthClient + 'static,
    T: TodoStore + 'static,
{
    pub fn new(
        settings: AppSettings,
        backend: BackendConfig,
        sessions: Arc<SessionManager<S, C>>,
        store: Arc<T>,
    ) -> Self {
        let navigator = Arc::new(MemoryNavigator::default());
        let route_guard = Arc::new(RouteGuard::new(Arc::clone(&navigator)));
        let task_list: TaskListSlot<T> = Arc::new(Mutex::new(None));

        let listener_guard = Arc::clone(&route_guard);
        let listener_tasks = Arc::clone(&task_list);
        let session_listener = sessions.add_listener(move |state: &SessionState| {
            follow_session(&listener_tasks, state);
            listener_guard.enforce(state);
        });

        Self {
            settings,
            backend,
            sessions,
            store,
            navigator,
            route_guard,
            task_list,
            _session_listener: session_listener,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &Arc<SessionManager<S, C>> {
        &self.sessions
    }

    pub fn navigator(&self) -> &Arc<MemoryNavigator> {
        &self.navigator
    }

    pub fn current_route(&self) -> Route {
        self.navigator.current()
    }

    /// Restores the stored session. Until this resolves every guarded route waits.
    pub async fn start(&self) -> SessionState {
        self.sessions.initialize().await;
        let state = self.sessions.snapshot();
        info!(signed_in = state.user.is_some(), "client started");
        state
    }

    pub fn navigate(&self, route: Route) -> GuardDecision {
        self.navigator.push(route);
        self.route_guard.enforce(&self.sessions.snapshot())
    }

    pub fn splash(&self) -> SplashScreen {
        SplashScreen::new(self.settings.splash_duration())
    }

    pub fn sign_up_view(&self) -> SignUpView<S, C, MemoryNavigator> {
        SignUpView::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.navigator),
            Some(self.callback_url()),
            self.settings.min_password_length,
        )
    }

    pub fn sign_in_view(&self) -> SignInView<S, C, MemoryNavigator> {
        SignInView::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.navigator),
            self.callback_url(),
        )
        .with_provider(self.backend.oauth_provider.clone())
    }

    /// Handles the browser landing on the callback route with `url` and returns
    /// where it was sent.
    pub async fn open_callback(&self, url: &str) -> Route {
        self.navigator.push(Route::AuthCallback);
        let events = self.sessions.subscribe();
        let snapshot = self.sessions.snapshot();

        if let Err(error) = self.sessions.complete_oauth_callback(url).await {
            warn!(error = %error, "auth callback did not produce a session");
        }

        let redirector = CallbackRedirector::new(
            Arc::clone(&self.navigator),
            RedirectConfig {
                callback_grace: self.settings.callback_grace(),
            },
        );
        redirector.run(snapshot, events).await
    }

    /// Task list of the signed-in user. The same controller is returned while
    /// that user stays signed in; a new one is loaded with a first fetch.
    pub async fn task_list(&self) -> Result<Arc<TaskListController<T>>, InfraError> {
        let user_id = self
            .sessions
            .current_user_id()
            .ok_or(InfraError::NotAuthenticated)?;
        let controller = {
            let mut slot = lock(&self.task_list);
            if let Some(existing) = slot.as_ref().filter(|existing| existing.user_id() == user_id) {
                return Ok(Arc::clone(existing));
            }
            let sessions: Arc<dyn SessionSource> = Arc::clone(&self.sessions) as Arc<dyn SessionSource>;
            let controller = Arc::new(TaskListController::new(Arc::clone(&self.store), sessions)?);
            *slot = Some(Arc::clone(&controller));
            controller
        };
        controller.list().await;
        Ok(controller)
    }

    pub async fn sign_out(&self) -> Result<(), InfraError> {
        self.sessions.sign_out().await
    }

    fn callback_url(&self) -> String {
        self.backend.site_route(Route::AuthCallback.path())
    }
}

fn follow_session<T>(task_list: &Mutex<Option<Arc<TaskListController<T>>>>, state: &SessionState)
where
    T: TodoStore,
{
    let current = state.user.as_ref().map(|user| user.id.as_str());
    let mut slot = lock(task_list);
    if slot
        .as_ref()
        .is_some_and(|controller| Some(controller.user_id()) != current)
    {
        *slot = None;
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
