use crate::domain::models::{normalize_task_text, sort_newest_first, Session, Todo};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::todo_store::{
    EqFilter, NewTodo, TodoColumn, TodoPatch, TodoQuery, TodoStore,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const EMPTY_TASK_MESSAGE: &str = "Task cannot be empty";

/// Where the task list gets the session it acts with.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// A session whose access token is valid right now, refreshed if needed.
    async fn active_session(&self) -> Result<Session, InfraError>;

    fn current_user_id(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDraft {
    pub id: String,
    pub text: String,
}

/// Everything the task list view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskListState {
    pub todos: Vec<Todo>,
    pub new_task: String,
    pub editing: Option<EditDraft>,
    /// Inline validation message for the task input; never sent to the backend.
    pub field_error: Option<String>,
    /// Dismissable banner text.
    pub error_message: Option<String>,
    pub in_flight: usize,
}

impl TaskListState {
    /// Mutating controls are disabled while this is set. Advisory only: nothing
    /// stops a second operation from being issued.
    pub fn busy(&self) -> bool {
        self.in_flight > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Nothing changed locally: the input was rejected before any request, or
    /// the response arrived after the signed-in user changed.
    Skipped,
    /// The request failed; the message is in the error banner.
    Failed,
}

/// Local mirror of one user's todos.
///
/// Each operation resolves a fresh session, awaits one store round trip
/// (toggling awaits two) and applies the result when it completes, unless the
/// signed-in user changed in the meantime. Operations are not cancelled or
/// serialized, so a slow response can land after, and overwrite, a newer one.
pub struct TaskListController<T>
where
    T: TodoStore,
{
    store: Arc<T>,
    sessions: Arc<dyn SessionSource>,
    user_id: String,
    state: Mutex<TaskListState>,
}

struct BusyGuard<'a> {
    state: &'a Mutex<TaskListState>,
}

impl<'a> BusyGuard<'a> {
    fn begin(state: &'a Mutex<TaskListState>) -> Self {
        let mut guard = lock(state);
        guard.in_flight += 1;
        guard.error_message = None;
        Self { state }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut guard = lock(self.state);
        guard.in_flight = guard.in_flight.saturating_sub(1);
    }
}

impl<T> TaskListController<T>
where
    T: TodoStore,
{
    /// Binds a list to the user signed in right now.
    pub fn new(store: Arc<T>, sessions: Arc<dyn SessionSource>) -> Result<Self, InfraError> {
        let user_id = sessions
            .current_user_id()
            .ok_or(InfraError::NotAuthenticated)?;
        Ok(Self {
            store,
            sessions,
            user_id,
            state: Mutex::new(TaskListState::default()),
        })
    }

    pub fn snapshot(&self) -> TaskListState {
        lock(&self.state).clone()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn set_new_task(&self, text: impl Into<String>) {
        let mut state = lock(&self.state);
        state.new_task = text.into();
        state.field_error = None;
    }

    pub fn dismiss_error(&self) {
        lock(&self.state).error_message = None;
    }

    /// Replaces the whole list with the user's rows, newest first. On failure the
    /// previous list stays.
    pub async fn list(&self) -> Outcome {
        let _busy = BusyGuard::begin(&self.state);
        let session = match self.acting_session().await {
            Ok(session) => session,
            Err(error) => return self.fail("fetch todos", &error),
        };
        let query = TodoQuery::owned_by(&self.user_id).newest_first();

        match self.store.select(&session, query).await {
            Ok(_) if !self.still_signed_in() => self.discard("fetch todos"),
            Ok(rows) => {
                let mut todos = owned_rows(rows, &self.user_id);
                sort_newest_first(&mut todos);
                info!(count = todos.len(), "fetched todos");
                lock(&self.state).todos = todos;
                Outcome::Applied
            }
            Err(error) => self.fail("fetch todos", &error),
        }
    }

    pub async fn submit_new_task(&self) -> Outcome {
        let text = lock(&self.state).new_task.clone();
        self.create(&text).await
    }

    pub async fn create(&self, text: &str) -> Outcome {
        let Some(task) = normalize_task_text(text) else {
            lock(&self.state).field_error = Some(EMPTY_TASK_MESSAGE.to_string());
            return Outcome::Skipped;
        };

        let _busy = BusyGuard::begin(&self.state);
        let session = match self.acting_session().await {
            Ok(session) => session,
            Err(error) => return self.fail("insert todo", &error),
        };
        let row = NewTodo {
            task,
            user_id: Some(self.user_id.clone()),
        };

        match self.store.insert(&session, vec![row]).await {
            Ok(_) if !self.still_signed_in() => self.discard("insert todo"),
            Ok(rows) => {
                let mut todos = owned_rows(rows, &self.user_id);
                let mut state = lock(&self.state);
                todos.append(&mut state.todos);
                state.todos = todos;
                state.new_task.clear();
                state.field_error = None;
                info!("created todo");
                Outcome::Applied
            }
            Err(error) => self.fail("insert todo", &error),
        }
    }

    /// Flips the completion flag, then refetches the whole list.
    pub async fn toggle_complete(&self, id: &str, current: bool) -> Outcome {
        let _busy = BusyGuard::begin(&self.state);
        let session = match self.acting_session().await {
            Ok(session) => session,
            Err(error) => return self.fail("update todo", &error),
        };
        let patch = TodoPatch {
            task: None,
            is_complete: Some(!current),
        };

        if let Err(error) = self
            .store
            .update(&session, EqFilter::new(TodoColumn::Id, id), patch)
            .await
        {
            return self.fail("update todo", &error);
        }
        if !self.still_signed_in() {
            return self.discard("update todo");
        }
        self.list().await
    }

    /// Saves new text for one todo and patches it in place.
    pub async fn update(&self, id: &str, new_text: &str) -> Outcome {
        let Some(task) = normalize_task_text(new_text) else {
            lock(&self.state).field_error = Some(EMPTY_TASK_MESSAGE.to_string());
            return Outcome::Skipped;
        };

        let _busy = BusyGuard::begin(&self.state);
        let session = match self.acting_session().await {
            Ok(session) => session,
            Err(error) => return self.fail("update task", &error),
        };
        let patch = TodoPatch {
            task: Some(task.clone()),
            is_complete: None,
        };

        match self
            .store
            .update(&session, EqFilter::new(TodoColumn::Id, id), patch)
            .await
        {
            Ok(_) if !self.still_signed_in() => self.discard("update task"),
            Ok(_) => {
                let mut state = lock(&self.state);
                if let Some(todo) = state.todos.iter_mut().find(|todo| todo.id == id) {
                    todo.task = task;
                }
                state.field_error = None;
                Outcome::Applied
            }
            Err(error) => self.fail("update task", &error),
        }
    }

    pub async fn remove(&self, id: &str) -> Outcome {
        let _busy = BusyGuard::begin(&self.state);
        let session = match self.acting_session().await {
            Ok(session) => session,
            Err(error) => return self.fail("delete todo", &error),
        };

        match self
            .store
            .delete(&session, EqFilter::new(TodoColumn::Id, id))
            .await
        {
            Ok(()) if !self.still_signed_in() => self.discard("delete todo"),
            Ok(()) => {
                lock(&self.state).todos.retain(|todo| todo.id != id);
                info!("deleted todo");
                Outcome::Applied
            }
            Err(error) => self.fail("delete todo", &error),
        }
    }

    pub fn start_edit(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(text) = state
            .todos
            .iter()
            .find(|todo| todo.id == id)
            .map(|todo| todo.task.clone())
        else {
            return false;
        };
        state.editing = Some(EditDraft {
            id: id.to_string(),
            text,
        });
        true
    }

    pub fn set_editing_text(&self, text: impl Into<String>) {
        if let Some(draft) = lock(&self.state).editing.as_mut() {
            draft.text = text.into();
        }
    }

    pub fn cancel_edit(&self) {
        lock(&self.state).editing = None;
    }

    /// Saves the draft being edited and leaves edit mode once it is stored.
    pub async fn save_edit(&self) -> Outcome {
        let Some(draft) = lock(&self.state).editing.clone() else {
            return Outcome::Skipped;
        };
        let outcome = self.update(&draft.id, &draft.text).await;
        if outcome == Outcome::Applied {
            let mut state = lock(&self.state);
            if state.editing.as_ref().is_some_and(|current| current.id == draft.id) {
                state.editing = None;
            }
        }
        outcome
    }

    async fn acting_session(&self) -> Result<Session, InfraError> {
        let session = self.sessions.active_session().await?;
        if session.user.id != self.user_id {
            return Err(InfraError::NotAuthenticated);
        }
        Ok(session)
    }

    fn still_signed_in(&self) -> bool {
        self.sessions.current_user_id().as_deref() == Some(self.user_id.as_str())
    }

    fn discard(&self, operation: &str) -> Outcome {
        warn!(operation, "signed-in user changed while the request was in flight; result dropped");
        Outcome::Skipped
    }

    fn fail(&self, operation: &str, error: &InfraError) -> Outcome {
        error!(operation, error = %error, "todo operation failed");
        lock(&self.state).error_message = Some(error.user_message());
        Outcome::Failed
    }
}

fn owned_rows(rows: Vec<Todo>, user_id: &str) -> Vec<Todo> {
    let total = rows.len();
    let owned: Vec<Todo> = rows.into_iter().filter(|todo| todo.user_id == user_id).collect();
    if owned.len() != total {
        warn!(dropped = total - owned.len(), "ignored todos owned by another user");
    }
    owned
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::User;
    use crate::infrastructure::todo_store::InMemoryTodoStore;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Session source whose signed-in user the test can swap at any point.
    struct SwitchableSessions {
        current: Mutex<Option<Session>>,
        resolve_calls: AtomicUsize,
    }

    impl SwitchableSessions {
        fn signed_in(user_id: &str) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(Some(session_for(user_id))),
                resolve_calls: AtomicUsize::new(0),
            })
        }

        fn switch_to(&self, session: Option<Session>) {
            *self.current.lock().expect("sessions mutex poisoned") = session;
        }
    }

    #[async_trait]
    impl SessionSource for SwitchableSessions {
        async fn active_session(&self) -> Result<Session, InfraError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.current
                .lock()
                .expect("sessions mutex poisoned")
                .clone()
                .ok_or(InfraError::NotAuthenticated)
        }

        fn current_user_id(&self) -> Option<String> {
            self.current
                .lock()
                .expect("sessions mutex poisoned")
                .as_ref()
                .map(|session| session.user.id.clone())
        }
    }

    /// Wraps the in-memory table, counting requests, failing on demand and
    /// optionally holding every request until the test hands out a permit.
    #[derive(Default)]
    struct RecordingTodoStore {
        inner: InMemoryTodoStore,
        calls: AtomicUsize,
        fail_with: Mutex<Option<String>>,
        extra_rows: Mutex<Vec<Todo>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingTodoStore {
        fn with_inner(inner: InMemoryTodoStore) -> Self {
            Self {
                inner,
                ..Self::default()
            }
        }

        fn fail_next(&self, message: &str) {
            *self.fail_with.lock().expect("fail mutex poisoned") = Some(message.to_string());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn check(&self) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            match self.fail_with.lock().expect("fail mutex poisoned").take() {
                Some(message) => Err(InfraError::backend(message)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl TodoStore for RecordingTodoStore {
        async fn select(&self, session: &Session, query: TodoQuery) -> Result<Vec<Todo>, InfraError> {
            self.check().await?;
            let mut rows = self.inner.select(session, query).await?;
            rows.extend(self.extra_rows.lock().expect("extra rows mutex poisoned").iter().cloned());
            Ok(rows)
        }

        async fn insert(&self, session: &Session, rows: Vec<NewTodo>) -> Result<Vec<Todo>, InfraError> {
            self.check().await?;
            self.inner.insert(session, rows).await
        }

        async fn update(
            &self,
            session: &Session,
            filter: EqFilter,
            patch: TodoPatch,
        ) -> Result<Vec<Todo>, InfraError> {
            self.check().await?;
            self.inner.update(session, filter, patch).await
        }

        async fn delete(&self, session: &Session, filter: EqFilter) -> Result<(), InfraError> {
            self.check().await?;
            self.inner.delete(session, filter).await
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn session_for(user_id: &str) -> Session {
        Session {
            access_token: format!("token-{user_id}"),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
            token_type: "bearer".to_string(),
            user: User {
                id: user_id.to_string(),
                email: Some(format!("{user_id}@example.com")),
            },
        }
    }

    fn row(id: &str, user_id: &str, task: &str, is_complete: bool, inserted_at: &str) -> Todo {
        Todo {
            id: id.to_string(),
            user_id: user_id.to_string(),
            task: task.to_string(),
            is_complete,
            inserted_at: fixed_time(inserted_at),
        }
    }

    fn seeded_table() -> InMemoryTodoStore {
        InMemoryTodoStore::default().with_rows(vec![
            row("b", "U1", "Pay bills", true, "2025-03-01T09:00:00Z"),
            row("a", "U1", "Buy milk", false, "2025-03-01T10:00:00Z"),
        ])
    }

    fn seeded_store() -> Arc<RecordingTodoStore> {
        Arc::new(RecordingTodoStore::with_inner(seeded_table()))
    }

    fn gated_store() -> (Arc<RecordingTodoStore>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = RecordingTodoStore {
            gate: Some(Arc::clone(&gate)),
            ..RecordingTodoStore::with_inner(seeded_table())
        };
        (Arc::new(store), gate)
    }

    fn controller_for(
        store: &Arc<RecordingTodoStore>,
        sessions: &Arc<SwitchableSessions>,
    ) -> TaskListController<RecordingTodoStore> {
        let sessions: Arc<dyn SessionSource> = Arc::clone(sessions) as Arc<dyn SessionSource>;
        TaskListController::new(Arc::clone(store), sessions).expect("signed-in controller")
    }

    fn ids(state: &TaskListState) -> Vec<String> {
        state.todos.iter().map(|todo| todo.id.clone()).collect()
    }

    async fn wait_for_calls(store: &RecordingTodoStore, count: usize) {
        while store.calls() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Lets `round_trips` gated requests through one at a time, checking that the
    /// list reports busy while each is held.
    async fn release_while_busy(
        store: &RecordingTodoStore,
        gate: &Semaphore,
        controller: &TaskListController<RecordingTodoStore>,
        task: tokio::task::JoinHandle<Outcome>,
        round_trips: usize,
    ) -> Outcome {
        for _ in 0..round_trips {
            let target = store.calls() + 1;
            wait_for_calls(store, target).await;
            assert!(controller.snapshot().busy());
            gate.add_permits(1);
        }
        let outcome = task.await.expect("operation task");
        assert!(!controller.snapshot().busy());
        outcome
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));

        assert_eq!(controller.list().await, Outcome::Applied);

        assert_eq!(ids(&controller.snapshot()), vec!["a", "b"]);
        assert!(!controller.snapshot().busy());
    }

    #[tokio::test]
    async fn repeated_list_is_stable() {
        let controller = controller_for(&seeded_store(), &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        let first = controller.snapshot().todos;
        controller.list().await;
        assert_eq!(controller.snapshot().todos, first);
    }

    #[tokio::test]
    async fn list_drops_rows_of_other_users() {
        let store = seeded_store();
        store
            .extra_rows
            .lock()
            .expect("extra rows mutex poisoned")
            .push(row("x", "U2", "Not mine", false, "2025-03-02T00:00:00Z"));
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));

        controller.list().await;

        assert_eq!(ids(&controller.snapshot()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_list_keeps_previous_rows() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;

        store.fail_next("JWT expired");
        assert_eq!(controller.list().await, Outcome::Failed);

        let state = controller.snapshot();
        assert_eq!(ids(&state), vec!["a", "b"]);
        assert_eq!(state.error_message.as_deref(), Some("JWT expired"));
    }

    #[tokio::test]
    async fn every_request_resolves_a_session_first() {
        let store = seeded_store();
        let sessions = SwitchableSessions::signed_in("U1");
        let controller = controller_for(&store, &sessions);

        controller.list().await;
        controller.toggle_complete("a", false).await;

        assert_eq!(sessions.resolve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blank_create_issues_no_request() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        let before = controller.snapshot().todos;
        let calls = store.calls();

        assert_eq!(controller.create("   \t ").await, Outcome::Skipped);

        assert_eq!(store.calls(), calls);
        let state = controller.snapshot();
        assert_eq!(state.todos, before);
        assert_eq!(state.field_error.as_deref(), Some(EMPTY_TASK_MESSAGE));
    }

    #[tokio::test]
    async fn create_prepends_trimmed_row_owned_by_user_and_clears_input() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        controller.set_new_task("  Water plants  ");

        assert_eq!(controller.submit_new_task().await, Outcome::Applied);

        let state = controller.snapshot();
        assert_eq!(state.todos.len(), 3);
        assert_eq!(state.todos[0].task, "Water plants");
        assert_eq!(state.todos[0].user_id, "U1");
        assert!(state.new_task.is_empty());
    }

    #[tokio::test]
    async fn failed_create_keeps_input_buffer() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.set_new_task("Water plants");
        store.fail_next("new row violates row-level security policy for table \"todos\"");

        assert_eq!(controller.submit_new_task().await, Outcome::Failed);

        let state = controller.snapshot();
        assert_eq!(state.new_task, "Water plants");
        assert!(state.todos.is_empty());
        assert!(state.error_message.is_some());
    }

    #[tokio::test]
    async fn toggle_complete_refetches_with_flipped_flag() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        let calls = store.calls();

        assert_eq!(controller.toggle_complete("a", false).await, Outcome::Applied);

        assert_eq!(store.calls(), calls + 2);
        let state = controller.snapshot();
        let toggled = state.todos.iter().find(|todo| todo.id == "a").expect("todo a");
        assert!(toggled.is_complete);
    }

    #[tokio::test]
    async fn failed_toggle_leaves_list_unchanged() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        let before = controller.snapshot().todos;
        store.fail_next("network error");

        assert_eq!(controller.toggle_complete("a", false).await, Outcome::Failed);

        assert_eq!(controller.snapshot().todos, before);
    }

    #[tokio::test]
    async fn blank_update_issues_no_request() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        let calls = store.calls();

        assert_eq!(controller.update("a", "").await, Outcome::Skipped);

        assert_eq!(store.calls(), calls);
        assert_eq!(controller.snapshot().todos[0].task, "Buy milk");
    }

    #[tokio::test]
    async fn edit_in_place_patches_single_row() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;

        assert!(controller.start_edit("b"));
        controller.set_editing_text("  Pay all bills ");
        assert_eq!(controller.save_edit().await, Outcome::Applied);

        let state = controller.snapshot();
        assert!(state.editing.is_none());
        assert_eq!(ids(&state), vec!["a", "b"]);
        assert_eq!(state.todos[1].task, "Pay all bills");
        assert_eq!(state.todos[0].task, "Buy milk");
    }

    #[tokio::test]
    async fn failed_save_stays_in_edit_mode() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        controller.start_edit("a");
        controller.set_editing_text("Buy oat milk");
        store.fail_next("network error");

        assert_eq!(controller.save_edit().await, Outcome::Failed);

        let state = controller.snapshot();
        assert_eq!(
            state.editing,
            Some(EditDraft {
                id: "a".to_string(),
                text: "Buy oat milk".to_string(),
            })
        );
        assert_eq!(state.todos[0].task, "Buy milk");
        assert!(!state.busy());
    }

    #[tokio::test]
    async fn remove_drops_row() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;

        assert_eq!(controller.remove("a").await, Outcome::Applied);

        assert_eq!(ids(&controller.snapshot()), vec!["b"]);
    }

    #[tokio::test]
    async fn failed_remove_keeps_row_and_shows_backend_message() {
        let store = seeded_store();
        let controller = controller_for(&store, &SwitchableSessions::signed_in("U1"));
        controller.list().await;
        store.fail_next("network error");

        assert_eq!(controller.remove("a").await, Outcome::Failed);

        let state = controller.snapshot();
        assert!(state.todos.iter().any(|todo| todo.id == "a"));
        assert_eq!(state.error_message.as_deref(), Some("network error"));

        controller.dismiss_error();
        assert!(controller.snapshot().error_message.is_none());
    }

    #[test]
    fn controller_needs_a_signed_in_user() {
        let sessions = SwitchableSessions::signed_in("U1");
        sessions.switch_to(None);
        let sessions: Arc<dyn SessionSource> = sessions;
        let result = TaskListController::new(seeded_store(), sessions);
        assert!(matches!(result, Err(InfraError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn rows_fetched_for_previous_user_are_discarded() {
        let (store, gate) = gated_store();
        let sessions = SwitchableSessions::signed_in("U1");
        let controller = Arc::new(controller_for(&store, &sessions));

        let listing = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.list().await }
        });
        wait_for_calls(&store, 1).await;
        sessions.switch_to(Some(session_for("U2")));
        gate.add_permits(1);

        assert_eq!(listing.await.expect("list task"), Outcome::Skipped);
        assert!(controller.snapshot().todos.is_empty());
    }

    #[tokio::test]
    async fn created_row_is_not_shown_after_user_switch() {
        let (store, gate) = gated_store();
        let sessions = SwitchableSessions::signed_in("U1");
        let controller = Arc::new(controller_for(&store, &sessions));

        let creating = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.create("Water plants").await }
        });
        wait_for_calls(&store, 1).await;
        sessions.switch_to(Some(session_for("U2")));
        gate.add_permits(1);

        assert_eq!(creating.await.expect("create task"), Outcome::Skipped);
        assert!(controller.snapshot().todos.is_empty());
    }

    #[tokio::test]
    async fn controller_of_previous_user_issues_no_requests() {
        let store = seeded_store();
        let sessions = SwitchableSessions::signed_in("U1");
        let controller = controller_for(&store, &sessions);
        sessions.switch_to(Some(session_for("U2")));

        assert_eq!(controller.create("Water plants").await, Outcome::Failed);
        assert_eq!(controller.list().await, Outcome::Failed);

        assert_eq!(store.calls(), 0);
        assert_eq!(
            controller.snapshot().error_message.as_deref(),
            Some("not signed in")
        );
    }

    #[tokio::test]
    async fn busy_is_set_for_the_duration_of_each_operation() {
        let (store, gate) = gated_store();
        let controller = Arc::new(controller_for(&store, &SwitchableSessions::signed_in("U1")));

        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.list().await }
        });
        assert_eq!(
            release_while_busy(&store, &gate, &controller, task, 1).await,
            Outcome::Applied
        );

        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.create("Water plants").await }
        });
        assert_eq!(
            release_while_busy(&store, &gate, &controller, task, 1).await,
            Outcome::Applied
        );

        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.toggle_complete("a", false).await }
        });
        assert_eq!(
            release_while_busy(&store, &gate, &controller, task, 2).await,
            Outcome::Applied
        );

        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.update("b", "Pay all bills").await }
        });
        assert_eq!(
            release_while_busy(&store, &gate, &controller, task, 1).await,
            Outcome::Applied
        );

        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.remove("a").await }
        });
        assert_eq!(
            release_while_busy(&store, &gate, &controller, task, 1).await,
            Outcome::Applied
        );

        assert_eq!(ids(&controller.snapshot()).len(), 2);
    }

    #[tokio::test]
    async fn overlapping_operations_keep_busy_until_the_last_finishes() {
        let (store, gate) = gated_store();
        let controller = Arc::new(controller_for(&store, &SwitchableSessions::signed_in("U1")));

        let first = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.list().await }
        });
        let second = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.remove("b").await }
        });
        wait_for_calls(&store, 2).await;
        assert_eq!(controller.snapshot().in_flight, 2);

        gate.add_permits(1);
        while controller.snapshot().in_flight > 1 {
            tokio::task::yield_now().await;
        }
        assert!(controller.snapshot().busy());

        gate.add_permits(1);
        first.await.expect("list task");
        second.await.expect("remove task");
        assert!(!controller.snapshot().busy());
    }

    proptest! {
        #[test]
        fn whitespace_only_text_never_reaches_the_store(text in "[ \t\n\r]{0,12}") {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let store = seeded_store();
                let sessions = SwitchableSessions::signed_in("U1");
                let controller = controller_for(&store, &sessions);

                assert_eq!(controller.create(&text).await, Outcome::Skipped);
                assert_eq!(controller.update("a", &text).await, Outcome::Skipped);
                assert_eq!(store.calls(), 0);
                assert_eq!(sessions.resolve_calls.load(Ordering::SeqCst), 0);
            });
        }
    }
}
