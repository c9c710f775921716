use crate::domain::models::{Session, Todo};
use crate::infrastructure::error::{backend_error, InfraError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use url::Url;

pub const TODOS_TABLE: &str = "todos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoColumn {
    Id,
    UserId,
    Task,
    IsComplete,
    InsertedAt,
}

impl TodoColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::UserId => "user_id",
            Self::Task => "task",
            Self::IsComplete => "is_complete",
            Self::InsertedAt => "inserted_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqFilter {
    pub column: TodoColumn,
    pub value: String,
}

impl EqFilter {
    pub fn new(column: TodoColumn, value: impl Into<String>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }

    fn matches(&self, todo: &Todo) -> bool {
        match self.column {
            TodoColumn::Id => todo.id == self.value,
            TodoColumn::UserId => todo.user_id == self.value,
            TodoColumn::Task => todo.task == self.value,
            TodoColumn::IsComplete => todo.is_complete.to_string() == self.value,
            TodoColumn::InsertedAt => todo.inserted_at.to_rfc3339() == self.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: TodoColumn,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoQuery {
    pub filters: Vec<EqFilter>,
    pub order: Option<OrderBy>,
}

impl TodoQuery {
    pub fn owned_by(user_id: &str) -> Self {
        Self {
            filters: vec![EqFilter::new(TodoColumn::UserId, user_id)],
            order: None,
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.order = Some(OrderBy {
            column: TodoColumn::InsertedAt,
            ascending: false,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NewTodo {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TodoPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
}

/// Row access to the hosted `todos` table. Every call is authorized as the
/// session's user; row ownership is enforced by the store, not the caller.
#[async_trait]
pub trait TodoStore: Send + Sync {
    async fn select(&self, session: &Session, query: TodoQuery) -> Result<Vec<Todo>, InfraError>;

    async fn insert(&self, session: &Session, rows: Vec<NewTodo>) -> Result<Vec<Todo>, InfraError>;

    async fn update(
        &self,
        session: &Session,
        filter: EqFilter,
        patch: TodoPatch,
    ) -> Result<Vec<Todo>, InfraError>;

    async fn delete(&self, session: &Session, filter: EqFilter) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTodoStore {
    client: Client,
    table_endpoint: Url,
    anon_key: String,
}

impl ReqwestTodoStore {
    pub fn new(project_url: &str, anon_key: impl Into<String>) -> Result<Self, InfraError> {
        let mut table_endpoint = Url::parse(project_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid backend url: {error}")))?;
        {
            let mut segments = table_endpoint.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("backend url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("rest");
            segments.push("v1");
            segments.push(TODOS_TABLE);
        }
        Ok(Self {
            client: Client::new(),
            table_endpoint,
            anon_key: anon_key.into(),
        })
    }

    fn ensure_session(session: &Session) -> Result<(), InfraError> {
        if session.access_token.trim().is_empty() {
            return Err(InfraError::NotAuthenticated);
        }
        Ok(())
    }

    fn filtered_endpoint(&self, filters: &[EqFilter]) -> Url {
        let mut url = self.table_endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for filter in filters {
                pairs.append_pair(filter.column.as_str(), &format!("eq.{}", filter.value));
            }
        }
        url
    }

    fn authorized(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
    }

    async fn send_for_body(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("network error while {action}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Network(format!("failed reading response while {action}: {error}")))?;

        if !status.is_success() {
            return Err(backend_error(status, &body));
        }
        Ok(body)
    }

    async fn send_rows<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<Vec<T>, InfraError> {
        let body = self.send_for_body(request, action).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<T>>(&body).map_err(|error| {
            InfraError::backend(format!("invalid rows payload while {action}: {error}"))
        })
    }
}

#[async_trait]
impl TodoStore for ReqwestTodoStore {
    async fn select(&self, session: &Session, query: TodoQuery) -> Result<Vec<Todo>, InfraError> {
        Self::ensure_session(session)?;

        let mut endpoint = self.filtered_endpoint(&query.filters);
        {
            let mut pairs = endpoint.query_pairs_mut();
            pairs.append_pair("select", "*");
            if let Some(order) = query.order {
                let direction = if order.ascending { "asc" } else { "desc" };
                pairs.append_pair("order", &format!("{}.{direction}", order.column.as_str()));
            }
        }

        let http = self.authorized(self.client.get(endpoint), session);
        self.send_rows(http, "listing todos").await
    }

    async fn insert(&self, session: &Session, rows: Vec<NewTodo>) -> Result<Vec<Todo>, InfraError> {
        Self::ensure_session(session)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut endpoint = self.table_endpoint.clone();
        endpoint.query_pairs_mut().append_pair("select", "*");
        let http = self
            .authorized(self.client.post(endpoint), session)
            .header("Prefer", "return=representation")
            .json(&rows);
        self.send_rows(http, "inserting todo").await
    }

    async fn update(
        &self,
        session: &Session,
        filter: EqFilter,
        patch: TodoPatch,
    ) -> Result<Vec<Todo>, InfraError> {
        Self::ensure_session(session)?;

        let mut endpoint = self.filtered_endpoint(std::slice::from_ref(&filter));
        endpoint.query_pairs_mut().append_pair("select", "*");
        let http = self
            .authorized(self.client.patch(endpoint), session)
            .header("Prefer", "return=representation")
            .json(&patch);
        self.send_rows(http, "updating todo").await
    }

    async fn delete(&self, session: &Session, filter: EqFilter) -> Result<(), InfraError> {
        Self::ensure_session(session)?;

        let endpoint = self.filtered_endpoint(std::slice::from_ref(&filter));
        let http = self.authorized(self.client.delete(endpoint), session);
        self.send_for_body(http, "deleting todo").await?;
        Ok(())
    }
}

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Local stand-in for the hosted table. Applies the same row ownership rule the
/// hosted store enforces: a session only ever sees and touches its own rows.
pub struct InMemoryTodoStore {
    rows: Mutex<Vec<Todo>>,
    next_id: Mutex<u64>,
    now_provider: NowProvider,
}

impl Default for InMemoryTodoStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            now_provider: Arc::new(Utc::now),
        }
    }
}

impl InMemoryTodoStore {
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_rows(self, rows: Vec<Todo>) -> Self {
        if let Ok(mut guard) = self.rows.lock() {
            *guard = rows;
        }
        self
    }

    fn lock_rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<Todo>>, InfraError> {
        self.rows
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("todo store lock poisoned: {error}")))
    }

    fn allocate_id(&self) -> Result<String, InfraError> {
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("todo id lock poisoned: {error}")))?;
        let id = *next_id;
        *next_id += 1;
        Ok(id.to_string())
    }
}

#[async_trait]
impl TodoStore for InMemoryTodoStore {
    async fn select(&self, session: &Session, query: TodoQuery) -> Result<Vec<Todo>, InfraError> {
        let rows = self.lock_rows()?;
        let mut selected: Vec<Todo> = rows
            .iter()
            .filter(|todo| todo.user_id == session.user_id())
            .filter(|todo| query.filters.iter().all(|filter| filter.matches(todo)))
            .cloned()
            .collect();
        if let Some(order) = query.order {
            selected.sort_by(|left, right| {
                let ordering = match order.column {
                    TodoColumn::Id => left.id.cmp(&right.id),
                    TodoColumn::UserId => left.user_id.cmp(&right.user_id),
                    TodoColumn::Task => left.task.cmp(&right.task),
                    TodoColumn::IsComplete => left.is_complete.cmp(&right.is_complete),
                    TodoColumn::InsertedAt => left.inserted_at.cmp(&right.inserted_at),
                };
                if order.ascending { ordering } else { ordering.reverse() }
            });
        }
        Ok(selected)
    }

    async fn insert(&self, session: &Session, rows: Vec<NewTodo>) -> Result<Vec<Todo>, InfraError> {
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            if row.user_id.as_deref().is_some_and(|owner| owner != session.user_id()) {
                return Err(InfraError::backend(
                    "new row violates row-level security policy for table \"todos\"",
                ));
            }
            let todo = Todo {
                id: self.allocate_id()?,
                user_id: session.user_id().to_string(),
                task: row.task,
                is_complete: false,
                inserted_at: (self.now_provider)(),
            };
            todo.validate().map_err(InfraError::backend)?;
            inserted.push(todo);
        }

        let mut stored = self.lock_rows()?;
        stored.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn update(
        &self,
        session: &Session,
        filter: EqFilter,
        patch: TodoPatch,
    ) -> Result<Vec<Todo>, InfraError> {
        let mut rows = self.lock_rows()?;
        let mut updated = Vec::new();
        for todo in rows
            .iter_mut()
            .filter(|todo| todo.user_id == session.user_id() && filter.matches(todo))
        {
            if let Some(task) = patch.task.as_ref() {
                todo.task = task.clone();
            }
            if let Some(is_complete) = patch.is_complete {
                todo.is_complete = is_complete;
            }
            updated.push(todo.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, session: &Session, filter: EqFilter) -> Result<(), InfraError> {
        let mut rows = self.lock_rows()?;
        rows.retain(|todo| !(todo.user_id == session.user_id() && filter.matches(todo)));
        Ok(())
    }
}
