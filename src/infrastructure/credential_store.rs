use crate::domain::models::Session;
use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

pub const DEFAULT_CREDENTIAL_SERVICE: &str = "todo-client.session";

/// Persists the signed-in session between runs.
pub trait CredentialStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<(), InfraError>;
    fn load_session(&self) -> Result<Option<Session>, InfraError>;
    fn delete_session(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL_SERVICE, "default")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_session(&self, session: &Session) -> Result<(), InfraError> {
        let payload = serde_json::to_string(session)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry()?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_session(&self) -> Result<Option<Session>, InfraError> {
        let payload = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let session = serde_json::from_str::<Session>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(session))
    }

    fn delete_session(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    session: Mutex<Option<Session>>,
}

impl InMemoryCredentialStore {
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_session(&self, session: &Session) -> Result<(), InfraError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn load_session(&self) -> Result<Option<Session>, InfraError> {
        let guard = self
            .session
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.clone())
    }

    fn delete_session(&self) -> Result<(), InfraError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}
