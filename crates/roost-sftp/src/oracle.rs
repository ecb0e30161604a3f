//! Credential oracle client.
//!
//! Authentication is owned by the control plane. Every SFTP login becomes a
//! `POST /api/remote/sftp` against it, and the response decides whether the
//! session exists and which capability tags it carries. Results are never
//! cached: re-authenticating on every connection is what makes permission
//! revocation prompt.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_HEADER: &str = "application/vnd.pterodactyl.v1+json";

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// A successful oracle response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    /// Tenant identifier; doubles as the subdirectory name under the data
    /// root.
    pub server: String,
    /// Issued but not consumed by the gateway today.
    #[serde(default)]
    pub token: String,
    /// Capability tags, or the single-element wildcard `["*"]`.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// HTTP client for the control plane's SFTP authentication endpoint.
pub struct CredentialOracle {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl CredentialOracle {
    pub fn new(base: &str, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(AUTH_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build oracle client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/remote/sftp", base.trim_end_matches('/')),
            token: token.into(),
        })
    }

    /// Validate a username/password pair.
    ///
    /// `404` means the credentials are wrong, `400` means the control plane
    /// refuses SFTP for this account ("server in bad state"); both are hard
    /// refusals. Anything else unexpected is a generic authentication
    /// failure with the response body logged.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<AuthGrant> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, ACCEPT_HEADER)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&AuthRequest { username, password })
            .send()
            .await
            .map_err(|e| Error::Authentication(format!("oracle request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => response
                .json::<AuthGrant>()
                .await
                .map_err(|e| Error::Authentication(format!("malformed oracle response: {e}"))),
            StatusCode::NOT_FOUND => {
                debug!(event = "auth_rejected", username, "oracle rejected credentials");
                Err(Error::InvalidCredentials)
            }
            StatusCode::BAD_REQUEST => {
                Err(Error::OracleUnavailable("server in bad state, SFTP denied".into()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    event = "auth_oracle_error",
                    username,
                    status = status.as_u16(),
                    body = %body,
                    "unexpected oracle response"
                );
                Err(Error::Authentication(format!(
                    "unexpected oracle status {status}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let oracle = CredentialOracle::new("https://panel.example.com/", "key").unwrap();
        assert_eq!(oracle.endpoint, "https://panel.example.com/api/remote/sftp");

        let oracle = CredentialOracle::new("https://panel.example.com", "key").unwrap();
        assert_eq!(oracle.endpoint, "https://panel.example.com/api/remote/sftp");
    }

    #[test]
    fn test_grant_decoding_defaults() {
        let grant: AuthGrant =
            serde_json::from_str(r#"{"server": "aaaa-bbbb"}"#).unwrap();
        assert_eq!(grant.server, "aaaa-bbbb");
        assert!(grant.token.is_empty());
        assert!(grant.permissions.is_empty());

        let grant: AuthGrant = serde_json::from_str(
            r#"{"server": "aaaa-bbbb", "token": "t", "permissions": ["*"]}"#,
        )
        .unwrap();
        assert_eq!(grant.permissions, vec!["*".to_string()]);
    }
}
