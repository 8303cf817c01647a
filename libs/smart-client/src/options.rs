//! Request descriptors and per-call FHIR options

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One HTTP request to execute against the FHIR server. The URL may be
/// relative; it is resolved against the session's `serverUrl`.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    /// Cancellation is propagated into the transport call, the refresh
    /// exchange, every reference fetch, and every pagination fetch.
    pub cancel: Option<CancellationToken>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            cancel: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl From<&str> for RequestSpec {
    fn from(url: &str) -> Self {
        RequestSpec::get(url)
    }
}

impl From<String> for RequestSpec {
    fn from(url: String) -> Self {
        RequestSpec::get(url)
    }
}

/// Callback receiving each page plus a snapshot of the references resolved so
/// far. When configured, pages are consumed exclusively through it and the
/// request resolves to [`FhirResult::None`].
pub type PageCallback =
    Arc<dyn Fn(Value, HashMap<String, Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options governing one top-level request and all of its descendants
/// (pagination fetches, the refresh retry, reference fetches).
#[derive(Clone)]
pub struct FhirOptions {
    /// Splice resolved references back into the resource tree. When `false`,
    /// resolved values are surfaced through the `references` side channel
    /// instead.
    pub graph: bool,
    /// Replace each Bundle page with its ordered `entry[].resource` array.
    pub flat: bool,
    /// Page budget, counted down across the `next`-link chain. The budget is
    /// decremented and then tested for non-zero, so `0` goes negative and
    /// never stops: the whole chain is walked. Kept as-is from the original
    /// protocol; pass `1` for exactly one page.
    pub page_limit: i64,
    /// Dot-paths of reference fields to resolve, shallower paths first.
    pub resolve_references: Vec<String>,
    /// Attempt a refresh-and-retry on 401.
    pub use_refresh_token: bool,
    pub on_page: Option<PageCallback>,
}

impl Default for FhirOptions {
    fn default() -> Self {
        Self {
            graph: true,
            flat: false,
            page_limit: 1,
            resolve_references: Vec::new(),
            use_refresh_token: true,
            on_page: None,
        }
    }
}

impl FhirOptions {
    pub fn with_on_page<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Value, HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_page = Some(Arc::new(move |page, references| {
            callback(page, references).boxed()
        }));
        self
    }
}

impl fmt::Debug for FhirOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FhirOptions")
            .field("graph", &self.graph)
            .field("flat", &self.flat)
            .field("page_limit", &self.page_limit)
            .field("resolve_references", &self.resolve_references)
            .field("use_refresh_token", &self.use_refresh_token)
            .field("on_page", &self.on_page.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Final outcome of one top-level request.
#[derive(Debug, Clone, PartialEq)]
pub enum FhirResult {
    /// The payload, reference-resolved and paginated as requested.
    Data(Value),
    /// `graph: false` with a non-empty `resolve_references` list: the
    /// untouched payload plus the resolved references keyed by `Type/id`.
    DataWithReferences {
        data: Value,
        references: HashMap<String, Value>,
    },
    /// Pages were streamed through `on_page`; there is nothing to return.
    None,
}

impl FhirResult {
    pub fn data(&self) -> Option<&Value> {
        match self {
            FhirResult::Data(data) | FhirResult::DataWithReferences { data, .. } => Some(data),
            FhirResult::None => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            FhirResult::Data(data) | FhirResult::DataWithReferences { data, .. } => Some(data),
            FhirResult::None => None,
        }
    }

    pub fn references(&self) -> Option<&HashMap<String, Value>> {
        match self {
            FhirResult::DataWithReferences { references, .. } => Some(references),
            _ => None,
        }
    }
}
