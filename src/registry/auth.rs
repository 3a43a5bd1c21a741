//! Registry authentication challenges
//!
//! Registries answer unauthenticated requests with `401` and a
//! `WWW-Authenticate` header. Bearer challenges are exchanged for a token at
//! the advertised realm; Basic challenges are answered with the credentials
//! directly.

use crate::config::AuthConfig;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{RelocatorError, Result};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params);
        let realm = params.get("realm")?.to_string();
        Some(Challenge::Bearer {
            realm,
            service: params.get("service").map(|s| s.to_string()),
            scope: params.get("scope").map(|s| s.to_string()),
        })
    }
}

/// Split `key="value",key2="a,b"` respecting quoted commas
fn parse_params(params: &str) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            }
        };

        parsed.insert(key, value.trim().to_string());
        rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    parsed
}

/// Credential to attach to registry requests
#[derive(Debug, Clone)]
pub enum Authorization {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Authorization {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Bearer(token) => request.bearer_auth(token),
            Authorization::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Answers authentication challenges for one registry
#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
}

impl Auth {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Obtain an authorization satisfying `challenge` for `scope`
    pub async fn authorize(
        &self,
        challenge: &Challenge,
        scope: &str,
        credentials: Option<&AuthConfig>,
    ) -> Result<Authorization> {
        match challenge {
            Challenge::Basic => {
                let credentials = credentials.ok_or_else(|| {
                    RelocatorError::Authentication(
                        "registry requires basic authentication but no credentials are configured"
                            .to_string(),
                    )
                })?;
                Ok(Authorization::Basic {
                    username: credentials.username.clone(),
                    password: credentials.password.clone(),
                })
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope = if scope.is_empty() {
                    challenge_scope.as_deref().unwrap_or_default()
                } else {
                    scope
                };
                let token = self
                    .fetch_token(realm, service.as_deref(), scope, credentials)
                    .await?;
                Ok(Authorization::Bearer(token))
            }
        }
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&AuthConfig>,
    ) -> Result<String> {
        let mut query = Vec::new();
        if let Some(service) = service {
            query.push(("service", service));
        }
        if !scope.is_empty() {
            query.push(("scope", scope));
        }
        let url = Url::parse_with_params(realm, &query)?;

        tracing::debug!(realm, scope, authenticated = credentials.is_some(), "requesting registry token");

        let mut request = self.client.get(url);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text));
        }

        let token: TokenResponse = response.json().await?;
        token.token.or(token.access_token).ok_or_else(|| {
            RelocatorError::Authentication("token response contained no token".to_string())
        })
    }
}
