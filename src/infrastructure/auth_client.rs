use crate::domain::models::{OAuthProvider, User};
use crate::infrastructure::error::{backend_error, InfraError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use url::Url;

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub token_type: Option<String>,
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The account exists but the address must be confirmed through the emailed link.
    ConfirmationRequired(User),
    /// The service auto-confirmed the account and issued a session.
    SignedIn(AuthTokenResponse),
}

/// Tokens or an error handed back to the callback route by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackParams {
    Tokens(AuthTokenResponse),
    Error { code: String, description: String },
    Empty,
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, InfraError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthTokenResponse, InfraError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthTokenResponse, InfraError>;

    async fn get_user(&self, access_token: &str) -> Result<User, InfraError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), InfraError>;

    fn authorize_url(&self, provider: &OAuthProvider, redirect_to: &str) -> Result<String, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestAuthClient {
    client: Client,
    auth_base: Url,
    anon_key: String,
}

#[derive(Debug, serde::Deserialize)]
struct TokenPayload {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    user: Option<User>,
}

impl From<TokenPayload> for AuthTokenResponse {
    fn from(payload: TokenPayload) -> Self {
        Self {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_in: payload.expires_in.unwrap_or(0).max(0),
            token_type: payload.token_type,
            user: payload.user,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct CredentialsBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

impl ReqwestAuthClient {
    pub fn new(project_url: &str, anon_key: impl Into<String>) -> Result<Self, InfraError> {
        let mut auth_base = Url::parse(project_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid backend url: {error}")))?;
        {
            let mut segments = auth_base.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("backend url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("auth");
            segments.push("v1");
        }
        Ok(Self {
            client: Client::new(),
            auth_base,
            anon_key: anon_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, InfraError> {
        let mut url = self.auth_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("auth endpoint cannot be a base".to_string())
            })?;
            segments.push(path);
        }
        Ok(url)
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn with_api_key(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("apikey", &self.anon_key)
    }

    async fn send_for_body(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("request failed while {action}: {error}")))?;

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

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<T, InfraError> {
        let body = self.send_for_body(request, action).await?;
        serde_json::from_str::<T>(&body).map_err(|error| {
            InfraError::Auth(format!("invalid payload while {action}: {error}; body={body}"))
        })
    }
}

#[async_trait]
impl AuthClient for ReqwestAuthClient {
    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, InfraError> {
        Self::ensure_non_empty(&request.email, "email")?;
        Self::ensure_non_empty(&request.password, "password")?;

        let mut endpoint = self.endpoint("signup")?;
        if let Some(redirect_to) = request.redirect_to.as_deref() {
            endpoint.query_pairs_mut().append_pair("redirect_to", redirect_to);
        }

        let http = self
            .with_api_key(self.client.post(endpoint))
            .bearer_auth(&self.anon_key)
            .json(&CredentialsBody {
                email: request.email.trim(),
                password: &request.password,
            });
        let payload: serde_json::Value = self.send_json(http, "signing up").await?;

        if payload.get("access_token").is_some() {
            let tokens: TokenPayload = serde_json::from_value(payload)?;
            return Ok(SignUpOutcome::SignedIn(tokens.into()));
        }
        let user_value = payload.get("user").cloned().unwrap_or(payload);
        let user: User = serde_json::from_value(user_value)?;
        Ok(SignUpOutcome::ConfirmationRequired(user))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthTokenResponse, InfraError> {
        Self::ensure_non_empty(email, "email")?;
        Self::ensure_non_empty(password, "password")?;

        let mut endpoint = self.endpoint("token")?;
        endpoint.query_pairs_mut().append_pair("grant_type", "password");
        let http = self
            .with_api_key(self.client.post(endpoint))
            .bearer_auth(&self.anon_key)
            .json(&CredentialsBody {
                email: email.trim(),
                password,
            });
        let payload: TokenPayload = self.send_json(http, "signing in").await?;
        Ok(payload.into())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthTokenResponse, InfraError> {
        Self::ensure_non_empty(refresh_token, "refresh token")?;

        let mut endpoint = self.endpoint("token")?;
        endpoint
            .query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let http = self
            .with_api_key(self.client.post(endpoint))
            .bearer_auth(&self.anon_key)
            .json(&RefreshBody { refresh_token });
        let payload: TokenPayload = self.send_json(http, "refreshing session").await?;
        Ok(payload.into())
    }

    async fn get_user(&self, access_token: &str) -> Result<User, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;

        let http = self
            .with_api_key(self.client.get(self.endpoint("user")?))
            .bearer_auth(access_token);
        self.send_json(http, "loading user").await
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;

        let http = self
            .with_api_key(self.client.post(self.endpoint("logout")?))
            .bearer_auth(access_token);
        self.send_for_body(http, "signing out").await?;
        Ok(())
    }

    fn authorize_url(&self, provider: &OAuthProvider, redirect_to: &str) -> Result<String, InfraError> {
        Self::ensure_non_empty(redirect_to, "redirect target")?;

        let mut url = self.endpoint("authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to);
        Ok(url.to_string())
    }
}

/// Reads the parameters the auth service appends to the callback route after an
/// OAuth or email-confirmation redirect. Tokens arrive in the fragment; errors
/// may arrive in either the fragment or the query string.
pub fn parse_callback_url(callback_url: &str) -> Result<CallbackParams, InfraError> {
    let url = Url::parse(callback_url)
        .map_err(|error| InfraError::Auth(format!("invalid callback url: {error}")))?;

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if let Some(fragment) = url.fragment() {
        pairs.extend(
            url::form_urlencoded::parse(fragment.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned())),
        );
    }
    let lookup = |key: &str| {
        pairs
            .iter()
            .rev()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    if let Some(code) = lookup("error_code").or_else(|| lookup("error")) {
        let description = lookup("error_description").unwrap_or_else(|| code.clone());
        return Ok(CallbackParams::Error { code, description });
    }

    let Some(access_token) = lookup("access_token") else {
        return Ok(CallbackParams::Empty);
    };
    let expires_in = lookup("expires_in")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0)
        .max(0);

    Ok(CallbackParams::Tokens(AuthTokenResponse {
        access_token,
        refresh_token: lookup("refresh_token"),
        expires_in,
        token_type: lookup("token_type"),
        user: None,
    }))
}

/// Local stand-in for the auth service. Accounts live in memory; tokens are
/// opaque counters.
#[derive(Debug)]
pub struct InMemoryAuthClient {
    accounts: Mutex<Vec<InMemoryAccount>>,
    issued: Mutex<Vec<IssuedTokens>>,
    next_token: AtomicU64,
    auto_confirm: bool,
}

#[derive(Debug, Clone)]
struct InMemoryAccount {
    user: User,
    password: String,
    confirmed: bool,
}

#[derive(Debug, Clone)]
struct IssuedTokens {
    access_token: String,
    refresh_token: String,
    user_id: String,
}

const IN_MEMORY_TOKEN_TTL_SECONDS: i64 = 3_600;

impl Default for InMemoryAuthClient {
    fn default() -> Self {
        Self {
            accounts: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            auto_confirm: false,
        }
    }
}

impl InMemoryAuthClient {
    /// Sign-ups issue a session immediately instead of waiting for email confirmation.
    pub fn auto_confirming() -> Self {
        Self {
            auto_confirm: true,
            ..Self::default()
        }
    }

    /// Registers a confirmed account.
    pub fn with_account(self, user: User, password: &str) -> Self {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.push(InMemoryAccount {
                user,
                password: password.to_string(),
                confirmed: true,
            });
        }
        self
    }

    /// Marks the account for `email` as confirmed, as following the emailed link would.
    pub fn confirm(&self, email: &str) -> Result<(), InfraError> {
        let mut accounts = self.lock_accounts()?;
        let account = accounts
            .iter_mut()
            .find(|account| account.user.email.as_deref() == Some(email))
            .ok_or_else(|| rejected(400, "User not found"))?;
        account.confirmed = true;
        Ok(())
    }

    /// Issues tokens for an existing account, as the provider round trip would.
    pub fn issue_tokens_for(&self, user_id: &str) -> Result<AuthTokenResponse, InfraError> {
        let user = self
            .lock_accounts()?
            .iter()
            .find(|account| account.user.id == user_id)
            .map(|account| account.user.clone())
            .ok_or_else(|| rejected(400, "User not found"))?;
        self.issue(user)
    }

    fn lock_accounts(&self) -> Result<MutexGuard<'_, Vec<InMemoryAccount>>, InfraError> {
        self.accounts
            .lock()
            .map_err(|error| InfraError::Auth(format!("account lock poisoned: {error}")))
    }

    fn lock_issued(&self) -> Result<MutexGuard<'_, Vec<IssuedTokens>>, InfraError> {
        self.issued
            .lock()
            .map_err(|error| InfraError::Auth(format!("token lock poisoned: {error}")))
    }

    fn issue(&self, user: User) -> Result<AuthTokenResponse, InfraError> {
        let sequence = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tokens = IssuedTokens {
            access_token: format!("access-{sequence}"),
            refresh_token: format!("refresh-{sequence}"),
            user_id: user.id.clone(),
        };
        self.lock_issued()?.push(tokens.clone());
        Ok(AuthTokenResponse {
            access_token: tokens.access_token,
            refresh_token: Some(tokens.refresh_token),
            expires_in: IN_MEMORY_TOKEN_TTL_SECONDS,
            token_type: Some("bearer".to_string()),
            user: Some(user),
        })
    }

    fn user_for_access_token(&self, access_token: &str) -> Result<User, InfraError> {
        let user_id = self
            .lock_issued()?
            .iter()
            .find(|tokens| tokens.access_token == access_token)
            .map(|tokens| tokens.user_id.clone())
            .ok_or_else(|| rejected(401, "invalid JWT"))?;
        self.lock_accounts()?
            .iter()
            .find(|account| account.user.id == user_id)
            .map(|account| account.user.clone())
            .ok_or_else(|| rejected(404, "User not found"))
    }
}

fn rejected(status: u16, message: &str) -> InfraError {
    InfraError::Backend {
        status: Some(status),
        message: message.to_string(),
    }
}

#[async_trait]
impl AuthClient for InMemoryAuthClient {
    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, InfraError> {
        ReqwestAuthClient::ensure_non_empty(&request.email, "email")?;
        ReqwestAuthClient::ensure_non_empty(&request.password, "password")?;
        let user = {
            let mut accounts = self.lock_accounts()?;
            if accounts
                .iter()
                .any(|account| account.user.email.as_deref() == Some(request.email.as_str()))
            {
                return Err(rejected(422, "User already registered"));
            }
            let user = User {
                id: format!("user-{}", accounts.len() + 1),
                email: Some(request.email.clone()),
            };
            accounts.push(InMemoryAccount {
                user: user.clone(),
                password: request.password,
                confirmed: self.auto_confirm,
            });
            user
        };

        if self.auto_confirm {
            Ok(SignUpOutcome::SignedIn(self.issue(user)?))
        } else {
            Ok(SignUpOutcome::ConfirmationRequired(user))
        }
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthTokenResponse, InfraError> {
        let account = self
            .lock_accounts()?
            .iter()
            .find(|account| account.user.email.as_deref() == Some(email) && account.password == password)
            .cloned()
            .ok_or_else(|| rejected(400, "Invalid login credentials"))?;
        if !account.confirmed {
            return Err(rejected(400, "Email not confirmed"));
        }
        self.issue(account.user)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthTokenResponse, InfraError> {
        let user_id = {
            let mut issued = self.lock_issued()?;
            let position = issued
                .iter()
                .position(|tokens| tokens.refresh_token == refresh_token)
                .ok_or_else(|| rejected(400, "Invalid Refresh Token: Refresh Token Not Found"))?;
            issued.remove(position).user_id
        };
        self.issue_tokens_for(&user_id)
    }

    async fn get_user(&self, access_token: &str) -> Result<User, InfraError> {
        self.user_for_access_token(access_token)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), InfraError> {
        let user = self.user_for_access_token(access_token)?;
        self.lock_issued()?.retain(|tokens| tokens.user_id != user.id);
        Ok(())
    }

    fn authorize_url(&self, provider: &OAuthProvider, redirect_to: &str) -> Result<String, InfraError> {
        let mut url = Url::parse("memory://auth/authorize")
            .map_err(|error| InfraError::InvalidConfig(error.to_string()))?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to);
        Ok(url.to_string())
    }
}
