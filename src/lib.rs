pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::app::App;
pub use application::forms::{SignInView, SignUpView, SplashScreen};
pub use application::route_guard::{
    guard, CallbackRedirector, GuardDecision, MemoryNavigator, Navigator, RouteGuard,
};
pub use application::session::{SessionManager, SessionState};
pub use application::todos::{Outcome, SessionSource, TaskListController, TaskListState};
pub use domain::models::{AuthEvent, AuthEventKind, OAuthProvider, Route, Session, Todo, User};
pub use infrastructure::error::InfraError;

use application::bootstrap::bootstrap_workspace;
use infrastructure::auth_client::ReqwestAuthClient;
use infrastructure::config::load_backend_config_from_env;
use infrastructure::credential_store::KeyringCredentialStore;
use infrastructure::logging::init_logging;
use infrastructure::todo_store::ReqwestTodoStore;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

pub type LiveApp = App<KeyringCredentialStore, ReqwestAuthClient, ReqwestTodoStore>;

/// Prepares the workspace, installs logging and connects to the backend named in
/// the environment. Keep the returned guard alive so buffered log lines are flushed.
pub async fn run(workspace_root: &Path) -> Result<(LiveApp, WorkerGuard), InfraError> {
    let bootstrap = bootstrap_workspace(workspace_root)?;
    let log_guard = init_logging(&bootstrap.logs_dir)?;
    let backend = load_backend_config_from_env()?;
    let app = App::connect(bootstrap.settings, backend)?;
    app.start().await;
    Ok((app, log_guard))
}
