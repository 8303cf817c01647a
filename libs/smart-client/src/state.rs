//! Session state and its persistence boundary
//!
//! `SessionState` is the launch state one client instance owns: where the FHIR
//! server lives, the OAuth endpoints discovered at launch time, and the mutable
//! `tokenResponse` the authorization server handed out. The serialized form
//! uses the camelCase field names of the SMART launch state so a persisted
//! session round-trips unchanged.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::Result;

/// Token fields granted by the authorization server.
///
/// Never null on a session; a session without tokens is a `TokenResponse`
/// with every field absent. Unknown fields returned by the token endpoint are
/// kept in `other` so a merge never discards them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl TokenResponse {
    /// Merge a fresh token-endpoint response into this one. Fields present in
    /// `incoming` replace the current values (a new refresh token replaces the
    /// old one); absent fields are left untouched.
    pub fn merge(&mut self, incoming: TokenResponse) {
        if incoming.access_token.is_some() {
            self.access_token = incoming.access_token;
        }
        if incoming.refresh_token.is_some() {
            self.refresh_token = incoming.refresh_token;
        }
        if incoming.id_token.is_some() {
            self.id_token = incoming.id_token;
        }
        if incoming.patient.is_some() {
            self.patient = incoming.patient;
        }
        if incoming.encounter.is_some() {
            self.encounter = incoming.encounter;
        }
        if incoming.scope.is_some() {
            self.scope = incoming.scope;
        }
        self.other.extend(incoming.other);
    }
}

/// State owned by one client instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Absolute http(s) base URL of the FHIR server.
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Storage lookup key for this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub token_response: TokenResponse,
}

impl SessionState {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token_uri: None,
            authorize_uri: None,
            scope: None,
            key: None,
            username: None,
            password: None,
            token_response: TokenResponse::default(),
        }
    }

    /// The scope the refresh grant is judged against: the one issued with the
    /// current tokens, falling back to the scope requested at launch.
    pub fn effective_scope(&self) -> Option<&str> {
        self.token_response
            .scope
            .as_deref()
            .or(self.scope.as_deref())
    }
}

/// Environment-specific session persistence.
///
/// Invoked by the refresh exchange after a successful token merge and by
/// session-clear after a terminal 401.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SessionState>>;
    async fn set(&self, key: &str, state: &SessionState) -> Result<()>;
    async fn unset(&self, key: &str) -> Result<()>;
}

/// In-memory storage backend; the default, and what tests run against.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, SessionState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, state: &SessionState) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_replaces_present_fields_and_keeps_absent_ones() {
        let mut current = TokenResponse {
            access_token: Some("old-access".into()),
            refresh_token: Some("old-refresh".into()),
            patient: Some("Patient/1".into()),
            ..Default::default()
        };

        let incoming: TokenResponse = serde_json::from_value(json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 3600
        }))
        .unwrap();

        current.merge(incoming);

        assert_eq!(current.access_token.as_deref(), Some("new-access"));
        assert_eq!(current.refresh_token.as_deref(), Some("new-refresh"));
        // Launch context granted earlier survives the merge.
        assert_eq!(current.patient.as_deref(), Some("Patient/1"));
        assert_eq!(current.other.get("expires_in"), Some(&json!(3600)));
    }

    #[test]
    fn session_state_serializes_in_camel_case() {
        let mut state = SessionState::new("https://fhir.example.org");
        state.token_uri = Some("https://auth.example.org/token".into());
        state.token_response.access_token = Some("abc".into());

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["serverUrl"], "https://fhir.example.org");
        assert_eq!(value["tokenUri"], "https://auth.example.org/token");
        assert_eq!(value["tokenResponse"]["access_token"], "abc");

        let back: SessionState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn effective_scope_prefers_token_response() {
        let mut state = SessionState::new("https://fhir.example.org");
        state.scope = Some("launch offline_access".into());
        assert_eq!(state.effective_scope(), Some("launch offline_access"));

        state.token_response.scope = Some("patient/*.read".into());
        assert_eq!(state.effective_scope(), Some("patient/*.read"));
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let state = SessionState::new("https://fhir.example.org");

        storage.set("sess-1", &state).await.unwrap();
        assert_eq!(storage.get("sess-1").await.unwrap(), Some(state));

        storage.unset("sess-1").await.unwrap();
        assert_eq!(storage.get("sess-1").await.unwrap(), None);
    }
}
