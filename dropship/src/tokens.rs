//! Access-token indirection for proxied downloads.

use crate::errors::DeployError;
use crate::metrics_defs::{TOKEN_LOOKUP_REJECTED, TOKENS_REGISTERED};
use metrics::counter;
use shared::clock::Clock;
use shared::volatile_map::VolatileMap;
use std::sync::Arc;
use std::time::Duration;

/// Maps short-lived access tokens to the real signed download URLs, so a peer
/// proxy can retrieve content through the service without ever seeing storage
/// credentials.
pub struct TokenRegistry {
    tokens: VolatileMap<String, String>,
}

impl TokenRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TokenRegistry {
            tokens: VolatileMap::new(clock),
        }
    }

    pub fn register(&self, access_token: String, download_url: String, time_to_live: Duration) {
        self.tokens.try_add(access_token, download_url, time_to_live);
        counter!(TOKENS_REGISTERED.name).increment(1);
    }

    /// Unknown and expired tokens are indistinguishable from forged ones.
    pub fn try_get_download_url(&self, access_token: &str) -> Result<String, DeployError> {
        match self.tokens.try_get(access_token) {
            Some(url) => Ok(url),
            None => {
                counter!(TOKEN_LOOKUP_REJECTED.name).increment(1);
                Err(DeployError::Unauthorized)
            }
        }
    }
}
