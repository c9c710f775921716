use crate::application::session::SessionState;
use crate::domain::models::{AuthEvent, AuthEventKind, Route};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

pub const DEFAULT_CALLBACK_GRACE: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// The session has not resolved yet; render a loading state.
    Wait,
    Stay,
    Redirect(Route),
}

pub fn guard(route: Route, state: &SessionState) -> GuardDecision {
    if state.loading {
        return GuardDecision::Wait;
    }
    let signed_in = state.user.is_some();
    if route.requires_session() && !signed_in {
        return GuardDecision::Redirect(Route::SignIn);
    }
    if route.is_unauthenticated_only() && signed_in {
        return GuardDecision::Redirect(Route::Dashboard);
    }
    GuardDecision::Stay
}

pub trait Navigator: Send + Sync {
    /// Navigates to `route` by pushing a new history entry.
    fn push(&self, route: Route);
    /// Navigates to `route` by replacing the current history entry.
    fn replace(&self, route: Route);
    fn current(&self) -> Route;
}

/// History stack kept in memory. Starts with a single entry.
#[derive(Debug)]
pub struct MemoryNavigator {
    history: Mutex<Vec<Route>>,
}

impl MemoryNavigator {
    pub fn new(initial: Route) -> Self {
        Self {
            history: Mutex::new(vec![initial]),
        }
    }

    pub fn history(&self) -> Vec<Route> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryNavigator {
    fn default() -> Self {
        Self::new(Route::SignUp)
    }
}

impl Navigator for MemoryNavigator {
    fn push(&self, route: Route) {
        if let Ok(mut history) = self.history.lock() {
            history.push(route);
        }
    }

    fn replace(&self, route: Route) {
        if let Ok(mut history) = self.history.lock() {
            match history.last_mut() {
                Some(current) => *current = route,
                None => history.push(route),
            }
        }
    }

    fn current(&self) -> Route {
        self.history
            .lock()
            .ok()
            .and_then(|history| history.last().copied())
            .unwrap_or(Route::SignUp)
    }
}

/// Applies [`guard`] to the navigator's current route.
pub struct RouteGuard<N>
where
    N: Navigator,
{
    navigator: Arc<N>,
}

impl<N> RouteGuard<N>
where
    N: Navigator,
{
    pub fn new(navigator: Arc<N>) -> Self {
        Self { navigator }
    }

    pub fn enforce(&self, state: &SessionState) -> GuardDecision {
        let route = self.navigator.current();
        let decision = guard(route, state);
        if let GuardDecision::Redirect(target) = decision {
            info!(from = route.path(), to = target.path(), "route guard redirect");
            self.navigator.replace(target);
        }
        decision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectConfig {
    /// How long the callback view waits for a late `SIGNED_IN` after the initial
    /// session resolved empty, before sending the visitor to sign-in.
    pub callback_grace: Duration,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            callback_grace: DEFAULT_CALLBACK_GRACE,
        }
    }
}

/// Decides where the OAuth / email-confirmation callback view goes once the
/// session settles.
pub struct CallbackRedirector<N>
where
    N: Navigator,
{
    navigator: Arc<N>,
    config: RedirectConfig,
}

impl<N> CallbackRedirector<N>
where
    N: Navigator,
{
    pub fn new(navigator: Arc<N>, config: RedirectConfig) -> Self {
        Self { navigator, config }
    }

    /// Waits for the session outcome and performs the redirect, returning the
    /// route it navigated to.
    ///
    /// `snapshot` must be taken after `events` was subscribed so that no
    /// notification falls between the two.
    pub async fn run(&self, snapshot: SessionState, mut events: broadcast::Receiver<AuthEvent>) -> Route {
        if snapshot.session.is_some() {
            return self.redirect(Route::Dashboard);
        }

        let mut deadline = if snapshot.loading {
            None
        } else {
            Some(Instant::now() + self.config.callback_grace)
        };

        loop {
            let received = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            debug!("callback grace window elapsed without a session");
                            return self.redirect(Route::SignIn);
                        }
                        received = events.recv() => received,
                    }
                }
                None => events.recv().await,
            };

            match received {
                Ok(AuthEvent {
                    kind: AuthEventKind::SignedIn | AuthEventKind::InitialSession,
                    session: Some(_),
                }) => return self.redirect(Route::Dashboard),
                Ok(AuthEvent {
                    kind: AuthEventKind::InitialSession,
                    session: None,
                }) => {
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + self.config.callback_grace);
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    if let Some(deadline) = deadline {
                        sleep_until(deadline).await;
                    }
                    return self.redirect(Route::SignIn);
                }
            }
        }
    }

    fn redirect(&self, route: Route) -> Route {
        info!(to = route.path(), "auth callback redirect");
        self.navigator.replace(route);
        route
    }
}
