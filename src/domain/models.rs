use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "user.id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub user: User,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        self.expires_at > now + chrono::Duration::seconds(leeway_seconds)
            && !self.access_token.trim().is_empty()
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Todo {
    #[serde(deserialize_with = "deserialize_row_id")]
    pub id: String,
    pub user_id: String,
    pub task: String,
    #[serde(default)]
    pub is_complete: bool,
    pub inserted_at: DateTime<Utc>,
}

impl Todo {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "todo.id")?;
        validate_non_empty(&self.user_id, "todo.user_id")?;
        validate_non_empty(&self.task, "todo.task")?;
        Ok(())
    }
}

/// Orders newest first. Ties keep their relative order.
pub fn sort_newest_first(todos: &mut [Todo]) {
    todos.sort_by(|left, right| right.inserted_at.cmp(&left.inserted_at));
}

/// Returns the trimmed task text, or `None` when nothing is left after trimming.
pub fn normalize_task_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl AuthEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OAuthProvider {
    Google,
    Github,
    Other(String),
}

impl OAuthProvider {
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => None,
            "google" => Some(Self::Google),
            "github" => Some(Self::Github),
            _ => Some(Self::Other(normalized)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
            Self::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    SignUp,
    SignIn,
    Dashboard,
    AuthCallback,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Self::SignUp => "/",
            Self::SignIn => "/signin",
            Self::Dashboard => "/dashboard",
            Self::AuthCallback => "/auth/callback",
        }
    }

    pub fn requires_session(self) -> bool {
        matches!(self, Self::Dashboard)
    }

    pub fn is_unauthenticated_only(self) -> bool {
        matches!(self, Self::SignUp | Self::SignIn)
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RowId {
    Text(String),
    Number(i64),
}

// The todos table may use either uuid or bigint identity keys.
fn deserialize_row_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RowId::deserialize(deserializer)? {
        RowId::Text(value) => value,
        RowId::Number(value) => value.to_string(),
    })
}
