//! Backend configuration

use std::env;
use std::fmt;

use tod_core::{TodError, TodResult};
use url::Url;

/// Environment variable holding the bearer API key
pub const API_KEY_VAR: &str = "API_KEY";

/// Environment variable holding the backend base URL
pub const DOMAIN_URL_VAR: &str = "DOMAIN_URL";

/// Settings needed to talk to the backend
#[derive(Clone)]
pub struct TodConfig {
    pub api_key: String,
    pub domain_url: Url,
}

impl TodConfig {
    pub fn new(api_key: impl Into<String>, domain_url: &str) -> TodResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(TodError::config(format!("{} cannot be empty", API_KEY_VAR)));
        }

        let domain_url = Url::parse(domain_url.trim()).map_err(|e| {
            TodError::config(format!("Invalid {} '{}': {}", DOMAIN_URL_VAR, domain_url, e))
        })?;

        if domain_url.cannot_be_a_base() {
            return Err(TodError::config(format!(
                "{} must be an absolute http(s) URL",
                DOMAIN_URL_VAR
            )));
        }

        Ok(Self { api_key, domain_url })
    }

    /// Load configuration from environment variables
    ///
    /// Expects:
    /// - API_KEY: bearer token for the backend
    /// - DOMAIN_URL: base URL of the backend
    pub fn from_env() -> TodResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TodResult<Self> {
        let api_key = lookup(API_KEY_VAR).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            TodError::config(format!(
                "Missing {} in environment. Please set {} in your .env file or environment.",
                API_KEY_VAR, API_KEY_VAR
            ))
        })?;

        let domain_url = lookup(DOMAIN_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                TodError::config(format!(
                    "Missing {} in environment. Please set {} in your .env file or environment.",
                    DOMAIN_URL_VAR, DOMAIN_URL_VAR
                ))
            })?;

        Self::new(api_key, &domain_url)
    }

    /// Base URL for the broadcasting auth endpoint
    ///
    /// The domain URL with any trailing slash and a trailing `/api` removed.
    pub fn broadcasting_base(&self) -> String {
        let base = self.domain_url.as_str().trim_end_matches('/');
        base.strip_suffix("/api").unwrap_or(base).to_string()
    }
}

impl fmt::Debug for TodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TodConfig")
            .field("api_key", &"[REDACTED]")
            .field("domain_url", &self.domain_url.as_str())
            .finish()
    }
}
