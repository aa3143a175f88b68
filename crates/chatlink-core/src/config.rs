//! Client configuration assembled from environment variables.
//!
//! | Variable                    | Meaning                         |
//! |-----------------------------|---------------------------------|
//! | `CHATLINK_APP_TOKEN`        | `X-App-Token-2` secret (required) |
//! | `CHATLINK_BACKEND_URL`      | session-token / conversation API |
//! | `CHATLINK_API_ROUTE`        | auth API base route             |
//! | `CHATLINK_CONVERSATION_SID` | default conversation            |
//! | `CHATLINK_CONFIG_DIR`       | credential store directory      |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::paths::default_config_dir_with;
use crate::retry::RetryPolicy;
use crate::types::ConversationSid;

pub const APP_TOKEN_VAR: &str = "CHATLINK_APP_TOKEN";
pub const BACKEND_URL_VAR: &str = "CHATLINK_BACKEND_URL";
pub const API_ROUTE_VAR: &str = "CHATLINK_API_ROUTE";
pub const CONVERSATION_SID_VAR: &str = "CHATLINK_CONVERSATION_SID";
pub const CONFIG_DIR_VAR: &str = "CHATLINK_CONFIG_DIR";

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";
pub const DEFAULT_API_ROUTE: &str = "https://stagingimages.com/api-mobile/v2";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("CHATLINK_APP_TOKEN environment variable is required")]
    MissingAppToken,

    #[error("Could not determine config directory: {0}")]
    NoConfigDir(String),
}

/// Fixed waits and bounds used while establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    /// How long `connect` waits for the platform client to reach `connected`.
    pub connect_timeout: Duration,
    /// Pause after participant-add / conversation-create before opening the conversation.
    pub settle_delay: Duration,
    /// Bounded retry for fetching a conversation that is not yet visible.
    pub conversation_fetch: RetryPolicy,
    /// Per-request timeout for the auth and backend HTTP APIs.
    pub request_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            conversation_fetch: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub app_token: String,
    pub backend_url: String,
    pub api_route: String,
    pub conversation_sid: Option<ConversationSid>,
    pub config_dir: PathBuf,
    pub timings: Timings,
}

impl ChatConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Empty values count as unset. A missing app token is fatal.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let app_token = get(APP_TOKEN_VAR).ok_or(ConfigError::MissingAppToken)?;

        let backend_url = get(BACKEND_URL_VAR)
            .map(|url| trim_url(&url))
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let api_route = get(API_ROUTE_VAR)
            .map(|url| trim_url(&url))
            .unwrap_or_else(|| DEFAULT_API_ROUTE.to_string());

        let config_dir = match get(CONFIG_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => default_config_dir_with(&lookup).map_err(ConfigError::NoConfigDir)?,
        };

        Ok(Self {
            app_token,
            backend_url,
            api_route,
            conversation_sid: get(CONVERSATION_SID_VAR).map(ConversationSid::new),
            config_dir,
            timings: Timings::default(),
        })
    }
}

fn trim_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
