//! The session-aware request pipeline
//!
//! `SmartClient` executes REST calls against a FHIR server on behalf of one
//! authorized session: it attaches the Authorization header, recovers from a
//! 401 with a single-flight refresh-token exchange followed by exactly one
//! retry, resolves cross-resource references depth-first with fetch
//! deduplication, and walks `next`-linked Bundle chains up to the configured
//! page budget.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth;
use crate::error::{Error, Result};
use crate::options::{FhirOptions, FhirResult, RequestSpec};
use crate::resolve::{self, ReferenceCache, ReferenceFetcher};
use crate::state::{MemoryStorage, SessionState, SessionStorage, TokenResponse};

const FHIR_JSON: &str = "application/fhir+json";

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<SessionState, Arc<Error>>>>;

/// What the transport handed back, before the pipeline shapes it.
enum Payload {
    Json(Value),
    /// Non-JSON bodies pass through untouched.
    Raw(String),
    Empty,
}

/// A client bound to one SMART session.
///
/// Cheap to clone; clones share the session state, the storage backend, and
/// the single-flight refresh slot. A clone is therefore the same client
/// instance as far as the refresh invariant is concerned.
#[derive(Clone)]
pub struct SmartClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: Url,
    state: RwLock<SessionState>,
    storage: Arc<dyn SessionStorage>,
    /// At most one refresh exchange in flight per client instance.
    refresh_task: Mutex<Option<SharedRefresh>>,
}

impl SmartClient {
    /// Create a client with in-memory session persistence.
    pub fn new(state: SessionState) -> Result<Self> {
        Self::with_storage(state, Arc::new(MemoryStorage::new()))
    }

    pub fn with_storage(state: SessionState, storage: Arc<dyn SessionStorage>) -> Result<Self> {
        Self::with_parts(state, storage, reqwest::Client::new())
    }

    /// Full control over the pieces, e.g. to supply a `reqwest::Client` with
    /// a cookie jar or custom timeouts.
    pub fn with_parts(
        state: SessionState,
        storage: Arc<dyn SessionStorage>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let mut base_url = Url::parse(&state.server_url)
            .map_err(|err| Error::InvalidServerUrl(format!("{}: {err}", state.server_url)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::InvalidServerUrl(format!(
                "{} must use the http or https scheme",
                state.server_url
            )));
        }
        // Joining relative paths needs the base to end in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                state: RwLock::new(state),
                storage,
                refresh_task: Mutex::new(None),
            }),
        })
    }

    /// A snapshot of the current session state.
    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    /// The patient id granted to this session via the launch context.
    pub async fn patient_id(&self) -> Option<String> {
        self.inner.state.read().await.token_response.patient.clone()
    }

    /// The encounter id granted to this session via the launch context.
    pub async fn encounter_id(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .token_response
            .encounter
            .clone()
    }

    /// Reset the session tokens and drop the persisted state.
    pub async fn clear_session(&self) -> Result<()> {
        let key = {
            let mut state = self.inner.state.write().await;
            state.token_response = TokenResponse::default();
            state.key.clone()
        };
        if let Some(key) = key {
            self.inner.storage.unset(&key).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Request pipeline
    // -----------------------------------------------------------------------

    /// Execute one request through the full pipeline: auth header,
    /// refresh-and-retry on 401, reference resolution, pagination.
    pub async fn request(
        &self,
        spec: impl Into<RequestSpec>,
        options: FhirOptions,
    ) -> Result<FhirResult> {
        let cache = ReferenceCache::new();
        self.request_with_cache(spec.into(), &options, cache).await
    }

    /// Convenience GET returning the bare payload with default options.
    pub async fn get(&self, url: impl Into<String>) -> Result<Value> {
        match self.request(RequestSpec::get(url), FhirOptions::default()).await? {
            FhirResult::Data(data) => Ok(data),
            FhirResult::DataWithReferences { data, .. } => Ok(data),
            FhirResult::None => Ok(Value::Null),
        }
    }

    /// POST a new resource; the target type is taken from `resourceType`.
    pub async fn create(&self, resource: Value) -> Result<FhirResult> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidResource("missing resourceType".into()))?
            .to_string();
        let spec = RequestSpec::get(resource_type)
            .with_method(Method::POST)
            .with_body(resource);
        self.request(spec, FhirOptions::default()).await
    }

    /// PUT an updated resource at `{resourceType}/{id}`.
    pub async fn update(&self, resource: Value) -> Result<FhirResult> {
        let (resource_type, id) = match (
            resource.get("resourceType").and_then(Value::as_str),
            resource.get("id").and_then(Value::as_str),
        ) {
            (Some(resource_type), Some(id)) => (resource_type.to_string(), id.to_string()),
            _ => {
                return Err(Error::InvalidResource(
                    "update requires resourceType and id".into(),
                ))
            }
        };
        let spec = RequestSpec::get(format!("{resource_type}/{id}"))
            .with_method(Method::PUT)
            .with_body(resource);
        self.request(spec, FhirOptions::default()).await
    }

    /// DELETE the resource at `url` (e.g. `"Patient/123"`).
    pub async fn delete(&self, url: impl Into<String>) -> Result<FhirResult> {
        let spec = RequestSpec::get(url).with_method(Method::DELETE);
        self.request(spec, FhirOptions::default()).await
    }

    /// The pagination loop. The reference cache is threaded through every
    /// page so identical references across pages still deduplicate.
    async fn request_with_cache(
        &self,
        spec: RequestSpec,
        options: &FhirOptions,
        cache: ReferenceCache,
    ) -> Result<FhirResult> {
        let fetcher = self.reference_fetcher(spec.cancel.clone(), options.use_refresh_token);
        let cancel = spec.cancel.clone();

        let mut budget = options.page_limit;
        let mut pages: Vec<Value> = Vec::new();
        let mut flat_entries: Vec<Value> = Vec::new();
        let mut paginated = false;
        let mut single: Option<Value> = None;

        let mut current = Some(spec);
        while let Some(page_spec) = current.take() {
            let payload = self
                .fetch_with_auth(&page_spec, options.use_refresh_token)
                .await?;

            let mut data = match payload {
                Payload::Json(value) => value,
                Payload::Empty => Value::Null,
                // Opaque payloads bypass resolution and pagination.
                Payload::Raw(text) => return Ok(FhirResult::Data(Value::String(text))),
            };

            let is_bundle = data.get("resourceType").and_then(Value::as_str) == Some("Bundle");
            if is_bundle {
                if let Some(entries) = data.get_mut("entry").and_then(Value::as_array_mut) {
                    for entry in entries.iter_mut() {
                        if let Some(resource) = entry.get_mut("resource") {
                            resolve::resolve_references(
                                resource,
                                &options.resolve_references,
                                options.graph,
                                &cache,
                                &fetcher,
                            )
                            .await?;
                        }
                    }
                }
            } else {
                resolve::resolve_references(
                    &mut data,
                    &options.resolve_references,
                    options.graph,
                    &cache,
                    &fetcher,
                )
                .await?;
            }

            if !is_bundle {
                single = Some(data);
                break;
            }

            // The next link must be read before flattening discards `link`.
            let next_url = next_link(&data);

            let page = if options.flat {
                Value::Array(
                    data.get("entry")
                        .and_then(Value::as_array)
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|entry| entry.get("resource").cloned())
                                .collect()
                        })
                        .unwrap_or_default(),
                )
            } else {
                data
            };

            if let Some(on_page) = &options.on_page {
                on_page(page.clone(), cache.snapshot()).await?;
            } else {
                match page {
                    Value::Array(entries) if options.flat => flat_entries.extend(entries),
                    other => pages.push(other),
                }
            }

            // Decrement, then test for non-zero. A budget of 1 never follows
            // `next`; a budget of 0 goes negative and follows the whole chain
            // (see FhirOptions::page_limit).
            budget -= 1;
            if budget != 0 {
                paginated = true;
                if let Some(next) = next_url {
                    let mut next_spec = RequestSpec::get(next);
                    if let Some(token) = cancel.clone() {
                        next_spec = next_spec.with_cancel(token);
                    }
                    current = Some(next_spec);
                }
            }
        }

        if options.on_page.is_some() {
            return Ok(FhirResult::None);
        }

        let data = if let Some(value) = single {
            value
        } else if options.flat {
            Value::Array(flat_entries)
        } else if pages.len() == 1 && !paginated {
            pages.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(pages)
        };

        if !options.graph && !options.resolve_references.is_empty() {
            return Ok(FhirResult::DataWithReferences {
                data,
                references: cache.snapshot(),
            });
        }
        Ok(FhirResult::Data(data))
    }

    /// Transport plus the strict 401/403 failure chain: refresh-and-retry
    /// exactly once, then terminal classification, with 403 logged and
    /// re-raised unchanged.
    async fn fetch_with_auth(&self, spec: &RequestSpec, use_refresh_token: bool) -> Result<Payload> {
        let mut attempted_refresh = false;
        loop {
            let error = match self.transport(spec).await {
                Ok(payload) => return Ok(payload),
                Err(error) => error,
            };

            match error.status() {
                Some(StatusCode::UNAUTHORIZED) => {
                    let (has_refresh_token, had_access_token) = {
                        let state = self.inner.state.read().await;
                        (
                            state.token_response.refresh_token.is_some(),
                            state.token_response.access_token.is_some(),
                        )
                    };

                    if use_refresh_token && has_refresh_token && !attempted_refresh {
                        attempted_refresh = true;
                        self.refresh(spec.cancel.clone()).await?;
                        continue;
                    }

                    if !had_access_token {
                        return Err(Error::NotAuthorized);
                    }
                    // The session existed but cannot be recovered. A storage
                    // failure while clearing must not mask the expiry.
                    if let Err(storage_error) = self.clear_session().await {
                        tracing::warn!(
                            error = %storage_error,
                            "failed to clear the expired session"
                        );
                    }
                    return Err(Error::SessionExpired);
                }
                Some(StatusCode::FORBIDDEN) => {
                    tracing::warn!(
                        url = %spec.url,
                        "access denied; the session scope does not permit this resource"
                    );
                    return Err(error);
                }
                _ => return Err(error),
            }
        }
    }

    /// One transport attempt: absolute URL, auth header, cancellation.
    async fn transport(&self, spec: &RequestSpec) -> Result<Payload> {
        let url = self.absolute_url(&spec.url)?;

        let mut request = self.inner.http.request(spec.method.clone(), url.clone());
        {
            let state = self.inner.state.read().await;
            if let Some(header) = auth::authorization_header(&state) {
                request = request.header(AUTHORIZATION, header);
            }
        }
        if let Some(body) = &spec.body {
            request = request.header(CONTENT_TYPE, FHIR_JSON).body(body.to_string());
        }
        // Caller-supplied headers are applied last so they win over the
        // derived Authorization and Content-Type.
        request = request.headers(spec.headers.clone());

        let attempt = async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(Error::Transport {
                    status,
                    url: url.to_string(),
                    message,
                });
            }

            let is_json = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.contains("json"))
                .unwrap_or(false);
            let body = response.text().await?;
            if body.is_empty() {
                Ok(Payload::Empty)
            } else if is_json {
                Ok(Payload::Json(serde_json::from_str(&body)?))
            } else {
                Ok(Payload::Raw(body))
            }
        };

        match &spec.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = attempt => result,
            },
            None => attempt.await,
        }
    }

    fn absolute_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(self
                .inner
                .base_url
                .join(url.trim_start_matches('/'))?),
            Err(err) => Err(err.into()),
        }
    }

    /// The fetch callback handed to the reference resolver; re-enters the
    /// authorized transport (including refresh-and-retry) but not the
    /// resolution/pagination stages.
    fn reference_fetcher(
        &self,
        cancel: Option<CancellationToken>,
        use_refresh_token: bool,
    ) -> ReferenceFetcher {
        let client = self.clone();
        Arc::new(move |reference: String| {
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                if client.absolute_url(&reference).is_err() {
                    return Err(Error::InvalidReferencePath(reference));
                }
                let mut spec = RequestSpec::get(reference.clone());
                if let Some(token) = cancel {
                    spec = spec.with_cancel(token);
                }
                match client.fetch_with_auth(&spec, use_refresh_token).await? {
                    Payload::Json(value) => Ok(value),
                    _ => Err(Error::InvalidReferencePath(format!(
                        "{reference} did not return a JSON resource"
                    ))),
                }
            }
            .boxed()
        })
    }

    // -----------------------------------------------------------------------
    // Token refresh
    // -----------------------------------------------------------------------

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers collapse into one in-flight exchange and all
    /// observe its result. The slot is cleared when the exchange settles,
    /// before the result reaches any awaiter.
    pub async fn refresh(&self, cancel: Option<CancellationToken>) -> Result<SessionState> {
        let (refresh_token, token_uri) = {
            let state = self.inner.state.read().await;
            auth::refresh_preconditions(&state)?
        };

        let shared = {
            let mut slot = self.inner.refresh_task.lock().expect("refresh slot poisoned");
            match &*slot {
                Some(task) => task.clone(),
                None => {
                    let client = self.clone();
                    let task = async move {
                        let result = client
                            .run_refresh(token_uri, refresh_token, cancel)
                            .await
                            .map_err(Arc::new);
                        client
                            .inner
                            .refresh_task
                            .lock()
                            .expect("refresh slot poisoned")
                            .take();
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(task.clone());
                    task
                }
            }
        };

        shared.await.map_err(Error::Shared)
    }

    async fn run_refresh(
        &self,
        token_uri: String,
        refresh_token: String,
        cancel: Option<CancellationToken>,
    ) -> Result<SessionState> {
        tracing::debug!("refreshing the access token");
        match auth::exchange_refresh_token(
            &self.inner.http,
            &token_uri,
            &refresh_token,
            cancel.as_ref(),
        )
        .await
        {
            Ok(token_response) => {
                let updated = {
                    let mut state = self.inner.state.write().await;
                    state.token_response.merge(token_response);
                    state.clone()
                };
                match &updated.key {
                    Some(key) => self.inner.storage.set(key, &updated).await?,
                    None => tracing::debug!(
                        "session has no storage key; skipping persistence of the refreshed state"
                    ),
                }
                tracing::debug!("access token refreshed");
                Ok(updated)
            }
            Err(error) => {
                // The refresh token is now presumed invalid; drop it so the
                // caller cannot retry the same token and loop.
                self.inner.state.write().await.token_response.refresh_token = None;
                Err(error)
            }
        }
    }
}

fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")
        .and_then(Value::as_array)?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_for(server_url: &str) -> SmartClient {
        SmartClient::new(SessionState::new(server_url)).unwrap()
    }

    #[test]
    fn rejects_non_http_server_urls() {
        assert!(matches!(
            SmartClient::new(SessionState::new("ftp://fhir.example.org")),
            Err(Error::InvalidServerUrl(_))
        ));
        assert!(matches!(
            SmartClient::new(SessionState::new("not a url")),
            Err(Error::InvalidServerUrl(_))
        ));
    }

    #[test]
    fn relative_urls_resolve_against_the_server_base() {
        let client = client_for("https://fhir.example.org/r4");
        assert_eq!(
            client.absolute_url("Patient/1").unwrap().as_str(),
            "https://fhir.example.org/r4/Patient/1"
        );
        assert_eq!(
            client.absolute_url("/Patient/1").unwrap().as_str(),
            "https://fhir.example.org/r4/Patient/1"
        );
        // Absolute URLs pass through untouched.
        assert_eq!(
            client.absolute_url("https://other.example.org/Patient/1").unwrap().as_str(),
            "https://other.example.org/Patient/1"
        );
    }

    #[test]
    fn next_link_finds_the_next_relation() {
        let bundle = json!({
            "resourceType": "Bundle",
            "link": [
                { "relation": "self", "url": "https://fhir.example.org/Observation" },
                { "relation": "next", "url": "https://fhir.example.org/Observation?page=2" }
            ]
        });
        assert_eq!(
            next_link(&bundle).as_deref(),
            Some("https://fhir.example.org/Observation?page=2")
        );
        assert_eq!(next_link(&json!({ "resourceType": "Bundle" })), None);
    }
}
