//! Authorization-header derivation and the refresh-token exchange wire call

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::state::{SessionState, TokenResponse};

/// Derive the `Authorization` header value for the current session.
///
/// Prefers a bearer token; falls back to basic auth when the session carries
/// credentials for a protected (non-OAuth) server. Pure function of the state,
/// re-evaluated on every transport attempt so it reflects a refresh
/// immediately.
pub fn authorization_header(state: &SessionState) -> Option<String> {
    if let Some(token) = &state.token_response.access_token {
        return Some(format!("Bearer {token}"));
    }
    match (&state.username, &state.password) {
        (Some(username), Some(password)) => Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{username}:{password}"))
        )),
        _ => None,
    }
}

/// Check, synchronously, that the session is in a position to refresh.
/// Returns the refresh token and token endpoint on success.
pub fn refresh_preconditions(state: &SessionState) -> Result<(String, String)> {
    let refresh_token = state
        .token_response
        .refresh_token
        .clone()
        .ok_or(Error::RefreshPrecondition("no refresh token found"))?;
    let token_uri = state
        .token_uri
        .clone()
        .ok_or(Error::RefreshPrecondition("no token endpoint found"))?;

    let scope = state.effective_scope().unwrap_or("");
    let has_refresh_scope = scope
        .split_whitespace()
        .any(|s| s == "offline_access" || s == "online_access");
    if !has_refresh_scope {
        return Err(Error::RefreshPrecondition(
            "the scope does not include offline_access or online_access",
        ));
    }

    Ok((refresh_token, token_uri))
}

/// POST the refresh grant to the token endpoint.
///
/// Body is `application/x-www-form-urlencoded` with
/// `grant_type=refresh_token&refresh_token=...`. A response without an access
/// token counts as a failed exchange even when the HTTP status is 200.
pub async fn exchange_refresh_token(
    http: &reqwest::Client,
    token_uri: &str,
    refresh_token: &str,
    cancel: Option<&CancellationToken>,
) -> Result<TokenResponse> {
    let send = http
        .post(token_uri)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send();

    let response = match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        },
        None => send.await?,
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::Transport {
            status,
            url: token_uri.to_string(),
            message,
        });
    }

    let token_response: TokenResponse = response.json().await?;
    if token_response.access_token.is_none() {
        return Err(Error::RefreshFailed(
            "no access token in the token endpoint response".into(),
        ));
    }
    Ok(token_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_wins_over_basic_credentials() {
        let mut state = SessionState::new("https://fhir.example.org");
        state.username = Some("alice".into());
        state.password = Some("secret".into());
        state.token_response.access_token = Some("tok-1".into());

        assert_eq!(authorization_header(&state).as_deref(), Some("Bearer tok-1"));
    }

    #[test]
    fn basic_auth_requires_both_username_and_password() {
        let mut state = SessionState::new("https://fhir.example.org");
        assert_eq!(authorization_header(&state), None);

        state.username = Some("alice".into());
        assert_eq!(authorization_header(&state), None);

        state.password = Some("secret".into());
        // base64("alice:secret")
        assert_eq!(
            authorization_header(&state).as_deref(),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
    }

    #[test]
    fn refresh_preconditions_are_each_reported() {
        let mut state = SessionState::new("https://fhir.example.org");
        assert!(matches!(
            refresh_preconditions(&state),
            Err(Error::RefreshPrecondition("no refresh token found"))
        ));

        state.token_response.refresh_token = Some("rt".into());
        assert!(matches!(
            refresh_preconditions(&state),
            Err(Error::RefreshPrecondition("no token endpoint found"))
        ));

        state.token_uri = Some("https://auth.example.org/token".into());
        assert!(matches!(
            refresh_preconditions(&state),
            Err(Error::RefreshPrecondition(msg))
                if msg.contains("offline_access")
        ));

        state.token_response.scope = Some("launch offline_access".into());
        let (refresh_token, token_uri) = refresh_preconditions(&state).unwrap();
        assert_eq!(refresh_token, "rt");
        assert_eq!(token_uri, "https://auth.example.org/token");
    }
}
