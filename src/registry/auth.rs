//! Token negotiation against the registry's `WWW-Authenticate` challenge.

use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, WWW_AUTHENTICATE};
use serde::Deserialize;

use super::{Transport, base_url};
use crate::config::Credentials;
use crate::error::{PullError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Bearer,
    Basic,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Bearer => "Bearer",
            Scheme::Basic => "Basic",
        }
    }
}

/// Parsed `WWW-Authenticate` challenge plus the scope we want.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: Scheme,
    pub realm: String,
    pub service: Option<String>,
    /// `repository:<name>:pull`
    pub scope: String,
}

/// A credential ready to be sent as an `Authorization` header.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub scheme: Scheme,
    pub value: String,
    pub issued_at: Instant,
}

impl AccessToken {
    fn new(scheme: Scheme, value: String) -> Self {
        Self {
            scheme,
            value,
            issued_at: Instant::now(),
        }
    }

    fn basic(credentials: &Credentials) -> Self {
        let encoded = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        Self::new(Scheme::Basic, encoded)
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme.as_str(), self.value)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parse a challenge such as
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
///
/// Returns `None` for unknown schemes or when `realm` is missing.
pub fn parse_www_authenticate(header: &str, scope: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
    let scheme = if scheme.eq_ignore_ascii_case("bearer") {
        Scheme::Bearer
    } else if scheme.eq_ignore_ascii_case("basic") {
        Scheme::Basic
    } else {
        return None;
    };

    let mut realm = None;
    let mut service = None;
    for part in split_auth_params(params) {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Some(AuthChallenge {
        scheme,
        realm: realm.filter(|r| !r.is_empty())?,
        service: service.filter(|s| !s.is_empty()),
        scope: scope.to_string(),
    })
}

/// Split auth header parameters on commas outside of quotes.
fn split_auth_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(s[start..].trim());
    }
    parts
}

pub fn pull_scope(repository: &str) -> String {
    format!("repository:{repository}:pull")
}

/// Probe `/v2/` without credentials.
///
/// - 200 → `None`, the registry is open.
/// - 401 → the parsed challenge.
/// - anything else, or an unparseable challenge → [`PullError::Auth`].
pub async fn negotiate(
    transport: &dyn Transport,
    registry: &str,
    repository: &str,
) -> Result<Option<AuthChallenge>> {
    let url = base_url(registry);
    let auth_err = |message: String| PullError::Auth {
        registry: registry.to_string(),
        message,
    };

    let response = transport
        .get(&url, HeaderMap::new())
        .await
        .map_err(|e| auth_err(e.to_string()))?;

    match response.status {
        200 => {
            tracing::debug!(registry, "registry requires no authentication");
            Ok(None)
        }
        401 => {
            let header = response
                .header(WWW_AUTHENTICATE.as_str())
                .ok_or_else(|| auth_err(format!("401 from {url} without a WWW-Authenticate header")))?;
            tracing::debug!(registry, challenge = header, "received auth challenge");
            let challenge = parse_www_authenticate(header, &pull_scope(repository))
                .ok_or_else(|| auth_err(format!("cannot parse WWW-Authenticate header: {header}")))?;
            Ok(Some(challenge))
        }
        status => Err(auth_err(format!(
            "unexpected HTTP {status} from {url} (expected 200 or 401)"
        ))),
    }
}

/// Obtain a token for `challenge`, optionally presenting basic credentials.
pub async fn authenticate(
    transport: &dyn Transport,
    registry: &str,
    challenge: &AuthChallenge,
    credentials: Option<&Credentials>,
) -> Result<AccessToken> {
    let auth_err = |message: String| PullError::Auth {
        registry: registry.to_string(),
        message,
    };

    if challenge.scheme == Scheme::Basic {
        return credentials
            .map(AccessToken::basic)
            .ok_or_else(|| auth_err("registry requires basic auth but no credentials were given".into()));
    }

    let mut params = Vec::with_capacity(2);
    if let Some(service) = &challenge.service {
        params.push(("service", service.as_str()));
    }
    params.push(("scope", challenge.scope.as_str()));
    let url = Url::parse_with_params(&challenge.realm, &params)
        .map_err(|e| auth_err(format!("invalid realm {}: {e}", challenge.realm)))?;

    let mut headers = HeaderMap::new();
    let basic = credentials.map(AccessToken::basic);
    if let Some(basic) = &basic {
        let value = HeaderValue::from_str(&basic.header_value())
            .map_err(|e| auth_err(format!("credentials cannot be sent as a header: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }

    let response = transport
        .get(url.as_str(), headers)
        .await
        .map_err(|e| auth_err(e.to_string()))?;
    if response.status != 200 {
        return Err(auth_err(format!(
            "token endpoint {} returned HTTP {}",
            challenge.realm, response.status
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| auth_err(format!("failed to read token response: {e}")))?;
    let parsed: TokenResponse = serde_json::from_slice(&body)
        .map_err(|e| auth_err(format!("failed to parse token response: {e}")))?;

    match parsed.token.or(parsed.access_token).filter(|t| !t.is_empty()) {
        Some(token) => Ok(AccessToken::new(Scheme::Bearer, token)),
        // Some registries accept the basic credential itself on later calls
        None => basic.ok_or_else(|| auth_err("token response has no 'token' field".into())),
    }
}

/// The negotiated auth state for one repository on one registry.
///
/// Keeps the challenge so fresh tokens can be requested without probing
/// `/v2/` again.
pub struct RegistrySession<'a> {
    transport: &'a dyn Transport,
    pub registry: String,
    pub repository: String,
    challenge: Option<AuthChallenge>,
    credentials: Option<Credentials>,
}

impl<'a> RegistrySession<'a> {
    /// Probe the registry and remember its challenge.
    pub async fn connect(
        transport: &'a dyn Transport,
        registry: &str,
        repository: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let challenge = negotiate(transport, registry, repository).await?;
        Ok(Self {
            transport,
            registry: registry.to_string(),
            repository: repository.to_string(),
            challenge,
            credentials,
        })
    }

    pub fn transport(&self) -> &'a dyn Transport {
        self.transport
    }

    /// Request a new token, or `None` if the registry is unauthenticated.
    pub async fn token(&self) -> Result<Option<AccessToken>> {
        match &self.challenge {
            None => Ok(None),
            Some(challenge) => {
                let token = authenticate(
                    self.transport,
                    &self.registry,
                    challenge,
                    self.credentials.as_ref(),
                )
                .await?;
                tracing::debug!(registry = %self.registry, scheme = ?token.scheme, "obtained token");
                Ok(Some(token))
            }
        }
    }

    /// Headers for a registry request: the given `Accept` (if any) plus
    /// `Authorization` for `token`.
    pub fn headers(&self, token: Option<&AccessToken>, accept: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&token.header_value()).map_err(|e| PullError::Auth {
                registry: self.registry.clone(),
                message: format!("token cannot be sent as a header: {e}"),
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(accept) = accept {
            headers.insert(
                reqwest::header::ACCEPT,
                HeaderValue::from_str(accept).map_err(|e| PullError::Format(e.to_string()))?,
            );
        }
        Ok(headers)
    }
}
