//! Access-credential minting
//!
//! The live endpoint authenticates each connection with a short-lived,
//! single-use token fetched from a backend mint endpoint immediately before
//! connect. Tokens are never reused across connections.

use serde::Deserialize;
use thiserror::Error;

/// Error type for credential minting
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mint endpoint returned no token")]
    MissingToken,
}

/// A short-lived connection credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Client for the backend token-mint endpoint.
pub struct TokenMinter {
    client: reqwest::Client,
    url: String,
}

impl TokenMinter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Exchange nothing for a fresh single-use token.
    pub async fn mint(&self) -> Result<EphemeralToken, AuthError> {
        let token: EphemeralToken = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if token.token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_deserialization() {
        let token: EphemeralToken =
            serde_json::from_str(r#"{"token": "tk-123", "expiresAt": "2026-08-07T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(token.token, "tk-123");
        assert!(token.expires_at.is_some());

        let bare: EphemeralToken = serde_json::from_str(r#"{"token": "tk-456"}"#).unwrap();
        assert!(bare.expires_at.is_none());
    }
}
