//! API keys and hub tokens.
//!
//! A credential is read from the backend config or the environment and kept
//! in a [`SecretString`] until the request that sends it.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use conductor_core::BackendConfig;

use super::ClientError;

/// A secret that prints as `[REDACTED]`.
pub struct ApiCredential {
    value: SecretString,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            name,
        }
    }

    /// `config_key` from the backend config, else `env_var`, else `None`.
    pub fn lookup(
        config: &BackendConfig,
        config_key: &str,
        env_var: &str,
        name: &'static str,
    ) -> Option<Self> {
        if let Some(value) = config.str(config_key) {
            tracing::debug!(credential = name, key = config_key, "Credential read from config");
            return Some(Self::new(value, name));
        }
        let value = std::env::var(env_var).ok()?;
        tracing::debug!(credential = name, env = env_var, "Credential read from environment");
        Some(Self::new(value, name))
    }

    /// Like [`ApiCredential::lookup`], but a missing credential is an error
    /// naming both places it was looked for.
    pub fn require(
        config: &BackendConfig,
        config_key: &str,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, ClientError> {
        Self::lookup(config, config_key, env_var, name).ok_or_else(|| {
            ClientError::NotConfigured(format!(
                "{name} required: set '{config_key}' in config or {env_var}"
            ))
        })
    }

    /// The secret value, for the request that sends it.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl Clone for ApiCredential {
    fn clone(&self) -> Self {
        Self::new(self.expose(), self.name)
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}([REDACTED])", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_value() {
        let cred = ApiCredential::new("hf_abcdef", "Hugging Face hub token");

        assert_eq!(format!("{cred:?}"), "Hugging Face hub token([REDACTED])");
        assert_eq!(format!("{:?}", Some(cred.clone())), "Some(Hugging Face hub token([REDACTED]))");
        assert_eq!(cred.expose(), "hf_abcdef");
    }

    #[test]
    fn test_config_wins_over_environment() {
        std::env::set_var("CONDUCTOR_TEST_TOKEN_PRIORITY", "from-env");
        let config = BackendConfig::new().with("hf_token", "from-config");

        let cred = ApiCredential::lookup(&config, "hf_token", "CONDUCTOR_TEST_TOKEN_PRIORITY", "token");
        let fallback = ApiCredential::lookup(
            &BackendConfig::new(),
            "hf_token",
            "CONDUCTOR_TEST_TOKEN_PRIORITY",
            "token",
        );
        std::env::remove_var("CONDUCTOR_TEST_TOKEN_PRIORITY");

        assert_eq!(cred.unwrap().expose(), "from-config");
        assert_eq!(fallback.unwrap().expose(), "from-env");
    }

    #[test]
    fn test_missing_required_key() {
        let err = ApiCredential::require(
            &BackendConfig::new(),
            "api_key",
            "CONDUCTOR_TEST_UNSET_KEY",
            "OpenAI API key",
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("'api_key'"));
        assert!(message.contains("CONDUCTOR_TEST_UNSET_KEY"));
    }
}
