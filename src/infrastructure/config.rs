use crate::domain::models::OAuthProvider;
use crate::infrastructure::credential_store::DEFAULT_CREDENTIAL_SERVICE;
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const DEFAULT_SITE_URL: &str = "http://localhost:3000";
const DEFAULT_CALLBACK_GRACE_MS: u64 = 2_000;
const DEFAULT_SPLASH_DURATION_MS: u64 = 2_500;
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 6;

/// Endpoint and key provisioning for the hosted backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
    pub site_url: String,
    pub oauth_provider: OAuthProvider,
}

impl BackendConfig {
    /// Absolute URL of a client route under the site origin, used as redirect target.
    pub fn site_route(&self, path: &str) -> String {
        format!("{}{}", self.site_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub schema: u8,
    pub callback_grace_ms: u64,
    pub splash_duration_ms: u64,
    pub min_password_length: usize,
    pub credential_service: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema: 1,
            callback_grace_ms: DEFAULT_CALLBACK_GRACE_MS,
            splash_duration_ms: DEFAULT_SPLASH_DURATION_MS,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            credential_service: DEFAULT_CREDENTIAL_SERVICE.to_string(),
        }
    }
}

impl AppSettings {
    pub fn callback_grace(&self) -> Duration {
        Duration::from_millis(self.callback_grace_ms)
    }

    pub fn splash_duration(&self) -> Duration {
        Duration::from_millis(self.splash_duration_ms)
    }

    fn validate(&self, path: &Path) -> Result<(), InfraError> {
        if self.schema != 1 {
            return Err(InfraError::InvalidConfig(format!(
                "unsupported schema {} in {}",
                self.schema,
                path.display()
            )));
        }
        if self.min_password_length == 0 {
            return Err(InfraError::InvalidConfig(format!(
                "minPasswordLength must be > 0 in {}",
                path.display()
            )));
        }
        if self.credential_service.trim().is_empty() {
            return Err(InfraError::InvalidConfig(format!(
                "credentialService must not be empty in {}",
                path.display()
            )));
        }
        Ok(())
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&AppSettings::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

pub fn load_settings(config_dir: &Path) -> Result<AppSettings, InfraError> {
    let path = config_dir.join(APP_JSON);
    let raw = fs::read_to_string(&path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }

    // Keys missing from an older file fall back to their defaults.
    let mut merged = serde_json::to_value(AppSettings::default())?;
    if let (Some(target), Some(source)) = (merged.as_object_mut(), parsed.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    let settings: AppSettings = serde_json::from_value(merged)
        .map_err(|error| InfraError::InvalidConfig(format!("{}: {error}", path.display())))?;
    settings.validate(&path)?;
    Ok(settings)
}

pub fn load_backend_config_from_env() -> Result<BackendConfig, InfraError> {
    load_backend_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_backend_config_from_lookup<F>(lookup: F) -> Result<BackendConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = required_lookup_value(
        &lookup,
        &["TODO_BACKEND_URL", "SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"],
        "backend url",
    )?;
    let anon_key = required_lookup_value(
        &lookup,
        &[
            "TODO_BACKEND_ANON_KEY",
            "SUPABASE_ANON_KEY",
            "NEXT_PUBLIC_SUPABASE_ANON_KEY",
        ],
        "backend anon key",
    )?;
    let site_url = optional_lookup_value(&lookup, &["TODO_SITE_URL", "SITE_URL"])
        .unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
    let oauth_provider = optional_lookup_value(&lookup, &["TODO_OAUTH_PROVIDER"])
        .and_then(|raw| OAuthProvider::parse(&raw))
        .unwrap_or(OAuthProvider::Google);

    url::Url::parse(&url)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid backend url '{url}': {error}")))?;
    url::Url::parse(&site_url).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid site url '{site_url}': {error}"))
    })?;

    Ok(BackendConfig {
        url,
        anon_key,
        site_url,
        oauth_provider,
    })
}

fn required_lookup_value<F>(
    lookup: &F,
    keys: &[&str],
    field_name: &str,
) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}
