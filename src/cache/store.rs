use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::convert::ConversionError;
use crate::resources::{DependencySet, Resource, ResourceError, ResourceStore};

use super::{
    CacheConfig, CacheError, CompilationContext, METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL,
    METRIC_CACHE_STALE_TOTAL, METRIC_COMPILE_MS, SingleFlight,
};

/// An artifact together with everything it was compiled from.
///
/// Entries are immutable. Recompiling a key installs a new entry with a new
/// dependency set; readers holding the old `Arc` keep a consistent view.
#[derive(Debug)]
pub struct CacheEntry<A> {
    key: String,
    artifact: A,
    dependencies: DependencySet,
}

impl<A> CacheEntry<A> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn artifact(&self) -> &A {
        &self.artifact
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.dependencies
    }

    pub fn is_stale(&self) -> bool {
        self.dependencies.has_changed()
    }
}

/// Key → [`CacheEntry`] map with staleness-checked lookup and single-flight
/// compilation on miss.
pub struct ArtifactCache<A> {
    label: &'static str,
    store: ResourceStore,
    entries: Arc<DashMap<String, Arc<CacheEntry<A>>>>,
    flights: SingleFlight<Arc<CacheEntry<A>>>,
}

impl<A> Clone for ArtifactCache<A> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            store: self.store.clone(),
            entries: Arc::clone(&self.entries),
            flights: self.flights.clone(),
        }
    }
}

impl<A> ArtifactCache<A>
where
    A: Send + Sync + 'static,
{
    /// `label` names this cache in logs and metrics.
    pub fn new(label: &'static str, store: ResourceStore, config: CacheConfig) -> Self {
        Self {
            label,
            store,
            entries: Arc::new(DashMap::new()),
            flights: SingleFlight::new(label, config),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Return the artifact for `resource`, compiling it when the cached entry
    /// is missing or any of its dependencies changed.
    ///
    /// Concurrent calls for the same key share one compilation. `compile`
    /// must read through the supplied context so every resource it touches
    /// becomes part of the new entry's dependency set.
    pub async fn get<F>(
        &self,
        resource: &Resource,
        compile: F,
    ) -> Result<Arc<CacheEntry<A>>, CacheError>
    where
        F: FnOnce(&mut CompilationContext) -> Result<A, ConversionError> + Send + 'static,
    {
        if let Some(entry) = self.fresh(resource.key()) {
            counter!(METRIC_CACHE_HIT_TOTAL, "cache" => self.label).increment(1);
            return Ok(entry);
        }
        counter!(METRIC_CACHE_MISS_TOTAL, "cache" => self.label).increment(1);

        let entries = Arc::clone(&self.entries);
        let store = self.store.clone();
        let primary = resource.clone();
        let label = self.label;
        self.flights
            .run(resource.key(), move || {
                compile_entry(&entries, store, primary, label, compile)
            })
            .await
    }

    /// Current entry for `key` without a staleness check.
    pub fn lookup(&self, key: &str) -> Option<Arc<CacheEntry<A>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry when it is still valid; drops it when stale.
    fn fresh(&self, key: &str) -> Option<Arc<CacheEntry<A>>> {
        let current = self.lookup(key)?;
        if !current.is_stale() {
            return Some(current);
        }

        counter!(METRIC_CACHE_STALE_TOTAL, "cache" => self.label).increment(1);
        debug!(cache = self.label, key, "dropping stale entry");
        // Only the version that was found stale is removed.
        self.entries
            .remove_if(key, |_, entry| Arc::ptr_eq(entry, &current));
        None
    }
}

fn compile_entry<A, F>(
    entries: &DashMap<String, Arc<CacheEntry<A>>>,
    store: ResourceStore,
    primary: Resource,
    label: &'static str,
    compile: F,
) -> Result<Arc<CacheEntry<A>>, CacheError>
where
    F: FnOnce(&mut CompilationContext) -> Result<A, ConversionError>,
{
    let key = primary.key().to_string();

    // A flight that completed between our lookup and this one starting may
    // already have installed a valid entry.
    let installed = entries.get(&key).map(|entry| Arc::clone(entry.value()));
    if let Some(entry) = installed
        && !entry.is_stale()
    {
        return Ok(entry);
    }

    let started = Instant::now();
    let mut context = CompilationContext::new(store, primary);
    let artifact = compile(&mut context).map_err(|err| classify(&key, err))?;
    let dependencies = context
        .dependency_set()
        .map_err(|err| classify(&key, err.into()))?;

    let entry = Arc::new(CacheEntry {
        key: key.clone(),
        artifact,
        dependencies,
    });
    entries.insert(key.clone(), Arc::clone(&entry));

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_COMPILE_MS, "cache" => label).record(elapsed_ms);
    info!(
        cache = label,
        key = %key,
        dependencies = entry.dependencies.len(),
        elapsed_ms,
        "compiled artifact"
    );
    Ok(entry)
}

/// A missing primary is a plain not-found; anything else is a conversion
/// failure attributed to the primary.
fn classify(key: &str, err: ConversionError) -> CacheError {
    match err {
        ConversionError::Resource(ResourceError::NotFound(missing)) if missing == key => {
            CacheError::NotFound(missing)
        }
        other => CacheError::conversion(key, other),
    }
}
