//! Cross-resource reference resolution
//!
//! Given a fetched resource and a set of dot-paths, fetch the resources those
//! paths reference and either splice them back into the tree (`graph` mode) or
//! collect them in a per-call cache surfaced to the caller. Paths are worked
//! through in ascending depth order so a reference inlined by a shallower path
//! is visible when a deeper path is evaluated; paths of equal depth run
//! concurrently, and concurrent fetches of the same `Type/id` collapse into
//! one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;

use crate::error::{Error, Result};

/// Fetches one referenced resource by its `Type/id` (or absolute) URL.
/// In practice this re-enters the client's request pipeline.
pub(crate) type ReferenceFetcher =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Value, Arc<Error>>>>;

enum Slot {
    /// A fetch is in flight; joiners await the same future instead of
    /// starting a second one.
    Pending(SharedFetch),
    Resolved(Value),
}

/// Per-call cache mapping reference ids to their in-flight fetch or resolved
/// value. Threaded unchanged through every pagination fetch of one top-level
/// call; never shared across unrelated calls.
#[derive(Clone, Default)]
pub struct ReferenceCache {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resolved entries, keyed by reference id. Pending fetches are not
    /// included.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .lock()
            .expect("reference cache poisoned")
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Resolved(value) => Some((key.clone(), value.clone())),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Fetch `reference` through the cache. The pending slot is installed in
    /// the same critical section that decides a fetch is needed, so a
    /// concurrent lookup of the same id joins it rather than racing it. On
    /// failure the slot is removed again, leaving retries possible.
    pub(crate) async fn fetch(
        &self,
        reference: &str,
        fetcher: &ReferenceFetcher,
    ) -> std::result::Result<Value, Arc<Error>> {
        let shared = {
            let mut slots = self.inner.lock().expect("reference cache poisoned");
            match slots.get(reference) {
                Some(Slot::Resolved(value)) => return Ok(value.clone()),
                Some(Slot::Pending(fetch)) => fetch.clone(),
                None => {
                    let fetch = fetcher(reference.to_string());
                    let shared = async move { fetch.await.map_err(Arc::new) }.boxed().shared();
                    slots.insert(reference.to_string(), Slot::Pending(shared.clone()));
                    shared
                }
            }
        };

        let result = shared.await;

        let mut slots = self.inner.lock().expect("reference cache poisoned");
        match &result {
            Ok(value) => {
                slots.insert(reference.to_string(), Slot::Resolved(value.clone()));
            }
            Err(_) => {
                if matches!(slots.get(reference), Some(Slot::Pending(_))) {
                    slots.remove(reference);
                }
            }
        }
        result
    }
}

/// Trim, drop empties, and dedupe (first occurrence wins).
pub(crate) fn sanitize_paths(paths: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for path in paths {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen.iter().any(|existing: &String| existing == trimmed) {
            seen.push(trimmed.to_string());
        }
    }
    seen
}

/// Group paths by dot-segment count, shallowest group first.
pub(crate) fn depth_groups(paths: Vec<String>) -> Vec<Vec<String>> {
    let mut by_depth: Vec<(usize, Vec<String>)> = Vec::new();
    for path in paths {
        let depth = path.split('.').count();
        match by_depth.iter_mut().find(|(d, _)| *d == depth) {
            Some((_, group)) => group.push(path),
            None => by_depth.push((depth, vec![path])),
        }
    }
    by_depth.sort_by_key(|(depth, _)| *depth);
    by_depth.into_iter().map(|(_, group)| group).collect()
}

/// Walk `root` along a dot-path; numeric segments index into arrays.
pub(crate) fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.split('.') {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Replace the node at a dot-path. Only writes into locations that already
/// exist; returns whether the write happened.
pub(crate) fn set_path(root: &mut Value, path: &str, value: Value) -> bool {
    let mut node = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let child = match node {
            Value::Object(map) => map.get_mut(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index)),
            _ => None,
        };
        match child {
            Some(child) if segments.peek().is_some() => node = child,
            Some(child) => {
                *child = value;
                return true;
            }
            None => return false,
        }
    }
    false
}

/// Resolve `paths` against `resource`, mutating it in place when `graph` is
/// set. Resolved values always land in `cache` regardless of mode.
pub(crate) async fn resolve_references(
    resource: &mut Value,
    paths: &[String],
    graph: bool,
    cache: &ReferenceCache,
    fetcher: &ReferenceFetcher,
) -> Result<()> {
    let paths = sanitize_paths(paths);
    if paths.is_empty() {
        return Ok(());
    }

    for group in depth_groups(paths) {
        resolve_group(resource, &group, graph, cache, fetcher).await?;
    }
    Ok(())
}

/// One depth group: collect the splice targets from an immutable walk, fetch
/// them all concurrently through the cache, then splice.
async fn resolve_group(
    resource: &mut Value,
    group: &[String],
    graph: bool,
    cache: &ReferenceCache,
    fetcher: &ReferenceFetcher,
) -> Result<()> {
    let mut targets: Vec<(String, String)> = Vec::new();
    for path in group {
        match get_path(resource, path) {
            None => {}
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    if let Some(reference) = item.get("reference").and_then(Value::as_str) {
                        targets.push((format!("{path}.{index}"), reference.to_string()));
                    }
                }
            }
            Some(node) => {
                if let Some(reference) = node.get("reference").and_then(Value::as_str) {
                    targets.push((path.clone(), reference.to_string()));
                }
            }
        }
    }

    let fetches = targets
        .iter()
        .map(|(_, reference)| cache.fetch(reference, fetcher));
    let results = futures::future::join_all(fetches).await;

    for ((location, reference), result) in targets.into_iter().zip(results) {
        match result {
            Ok(value) => {
                if graph {
                    set_path(resource, &location, value);
                }
            }
            // A dangling reference is not an error; leave the node as-is.
            Err(error) if error.is_not_found() => {
                tracing::debug!(%reference, "referenced resource not found, leaving unresolved");
            }
            Err(error) => {
                return Err(Error::ReferenceFetch {
                    reference,
                    source: Box::new(Error::Shared(error)),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sanitize_trims_drops_empties_and_dedupes() {
        let paths = vec![
            " subject ".to_string(),
            "".to_string(),
            "subject".to_string(),
            "performer".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(sanitize_paths(&paths), vec!["subject", "performer"]);
    }

    #[test]
    fn groups_are_ordered_by_depth() {
        let groups = depth_groups(vec![
            "subject.organization.partOf".to_string(),
            "performer".to_string(),
            "subject.organization".to_string(),
            "encounter".to_string(),
        ]);
        assert_eq!(
            groups,
            vec![
                vec!["performer".to_string(), "encounter".to_string()],
                vec!["subject.organization".to_string()],
                vec!["subject.organization.partOf".to_string()],
            ]
        );
    }

    #[test]
    fn get_path_walks_objects_and_arrays() {
        let resource = json!({
            "subject": { "reference": "Patient/1" },
            "performer": [
                { "reference": "Practitioner/9" },
                { "reference": "Practitioner/7" }
            ]
        });
        assert_eq!(
            get_path(&resource, "subject.reference"),
            Some(&json!("Patient/1"))
        );
        assert_eq!(
            get_path(&resource, "performer.1.reference"),
            Some(&json!("Practitioner/7"))
        );
        assert_eq!(get_path(&resource, "performer.5"), None);
        assert_eq!(get_path(&resource, "missing.path"), None);
    }

    #[test]
    fn set_path_preserves_array_index() {
        let mut resource = json!({
            "performer": [
                { "reference": "Practitioner/9" },
                { "reference": "Practitioner/7" }
            ]
        });
        assert!(set_path(
            &mut resource,
            "performer.1",
            json!({ "resourceType": "Practitioner", "id": "7" })
        ));
        assert_eq!(resource["performer"][0]["reference"], "Practitioner/9");
        assert_eq!(resource["performer"][1]["resourceType"], "Practitioner");

        // Writes into locations that do not exist are refused.
        assert!(!set_path(&mut resource, "missing.path", json!(1)));
    }

    fn counting_fetcher(counter: Arc<AtomicUsize>) -> ReferenceFetcher {
        Arc::new(move |reference: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Suspend once so concurrent lookups overlap the fetch.
                tokio::task::yield_now().await;
                Ok(json!({ "resourceType": "Patient", "id": reference }))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn concurrent_lookups_of_one_reference_fetch_once() {
        let cache = ReferenceCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(counter.clone());

        let (a, b, c) = tokio::join!(
            cache.fetch("Patient/1", &fetcher),
            cache.fetch("Patient/1", &fetcher),
            cache.fetch("Patient/1", &fetcher),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(c.unwrap()["resourceType"], "Patient");
    }

    #[tokio::test]
    async fn failed_fetch_clears_the_slot_for_retry() {
        let cache = ReferenceCache::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_fetcher = attempts.clone();
        let fetcher: ReferenceFetcher = Arc::new(move |reference: String| {
            let attempts = attempts_in_fetcher.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::RefreshFailed("boom".into()))
                } else {
                    Ok(json!({ "id": reference }))
                }
            }
            .boxed()
        });

        assert!(cache.fetch("Patient/1", &fetcher).await.is_err());
        assert!(cache.snapshot().is_empty());

        // The placeholder was removed, so a second caller may retry.
        assert!(cache.fetch("Patient/1", &fetcher).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn deeper_paths_see_shallower_results() {
        let cache = ReferenceCache::new();
        let fetcher: ReferenceFetcher = Arc::new(|reference: String| {
            async move {
                match reference.as_str() {
                    "Patient/1" => Ok(json!({
                        "resourceType": "Patient",
                        "id": "1",
                        "managingOrganization": { "reference": "Organization/org" }
                    })),
                    "Organization/org" => Ok(json!({
                        "resourceType": "Organization",
                        "id": "org"
                    })),
                    other => Err(Error::InvalidReferencePath(other.to_string())),
                }
            }
            .boxed()
        });

        let mut resource = json!({
            "resourceType": "Observation",
            "subject": { "reference": "Patient/1" }
        });
        let paths = vec![
            "subject".to_string(),
            "subject.managingOrganization".to_string(),
        ];
        resolve_references(&mut resource, &paths, true, &cache, &fetcher)
            .await
            .unwrap();

        // The deeper path was evaluated against the already-spliced Patient.
        assert_eq!(
            resource["subject"]["managingOrganization"]["resourceType"],
            "Organization"
        );
    }

    #[tokio::test]
    async fn graph_false_leaves_the_tree_untouched() {
        let cache = ReferenceCache::new();
        let fetcher = counting_fetcher(Arc::new(AtomicUsize::new(0)));

        let mut resource = json!({ "subject": { "reference": "Patient/1" } });
        let original = resource.clone();
        resolve_references(
            &mut resource,
            &["subject".to_string()],
            false,
            &cache,
            &fetcher,
        )
        .await
        .unwrap();

        assert_eq!(resource, original);
        assert!(cache.snapshot().contains_key("Patient/1"));
    }
}
