use std::collections::HashSet;

use bytes::Bytes;

use crate::convert::{Fetched, IncludeFetcher};
use crate::resources::{DependencySet, ObservedResource, Resource, ResourceError, ResourceStore};

/// Call-scoped record of every resource read during one compilation.
///
/// Created per compile and handed by `&mut` through the converter call
/// graph; nested includes share the same context so transitive reads land in
/// one [`DependencySet`].
#[derive(Debug)]
pub struct CompilationContext {
    store: ResourceStore,
    primary: Resource,
    primary_observed: Option<ObservedResource>,
    includes: Vec<ObservedResource>,
    seen: HashSet<String>,
}

impl CompilationContext {
    pub fn new(store: ResourceStore, primary: Resource) -> Self {
        Self {
            store,
            primary,
            primary_observed: None,
            includes: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn primary(&self) -> &Resource {
        &self.primary
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Record a read. The first observation of a key wins.
    pub fn record(&mut self, observed: ObservedResource) {
        if observed.key() == self.primary.key() {
            if self.primary_observed.is_none() {
                self.primary_observed = Some(observed);
            }
            return;
        }
        if self.seen.insert(observed.key().to_string()) {
            self.includes.push(observed);
        }
    }

    pub fn read_primary(&mut self) -> Result<String, ResourceError> {
        let (content, observed) = self.primary.read_string()?;
        self.record(observed);
        Ok(content)
    }

    pub fn read_primary_bytes(&mut self) -> Result<Bytes, ResourceError> {
        let (content, observed) = self.primary.read_bytes()?;
        self.record(observed);
        Ok(content)
    }

    /// Read an already resolved resource, recording it as a dependency.
    pub fn read(&mut self, resource: &Resource) -> Result<String, ResourceError> {
        let (content, observed) = resource.read_string()?;
        self.record(observed);
        Ok(content)
    }

    /// Resolve and read a sub-resource, recording it as a dependency.
    pub fn read_include(&mut self, name: &str) -> Result<(Resource, String), ResourceError> {
        let resource = self
            .store
            .resolve(name)
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))?;
        let content = self.read(&resource)?;
        Ok((resource, content))
    }

    /// Number of sub-resources recorded so far.
    pub fn include_count(&self) -> usize {
        self.includes.len()
    }

    /// Close the context. A primary that was never read is observed now.
    pub fn dependency_set(self) -> Result<DependencySet, ResourceError> {
        let primary = match self.primary_observed {
            Some(observed) => observed,
            None => self.primary.observe()?,
        };
        Ok(DependencySet::new(primary, self.includes))
    }
}

impl IncludeFetcher for CompilationContext {
    fn fetch(&mut self, name: &str) -> Result<Fetched, ResourceError> {
        let (resource, content) = self.read_include(name)?;
        Ok(Fetched {
            key: resource.key().to_string(),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::convert::{ConvertOptions, Converter, LessConverter};

    #[test]
    fn nested_imports_are_recorded_transitively() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("a.less"), "@import \"b\";\n.a { color: @c; }").expect("write");
        fs::write(dir.path().join("b.less"), "@import \"c\";").expect("write");
        fs::write(dir.path().join("c.less"), "@c: red;").expect("write");
        let store = ResourceStore::new(dir.path()).expect("store");
        let primary = store.resolve("a.less").expect("a");

        let mut context = CompilationContext::new(store, primary);
        let source = context.read_primary().expect("read a");
        let css = LessConverter
            .convert(&source, &ConvertOptions::new("a.less", true), &mut context)
            .expect("compiled");
        assert_eq!(css, ".a{color:red}");

        let set = context.dependency_set().expect("set");
        assert_eq!(set.primary().key(), "a.less");
        assert!(set.contains("b.less"));
        assert!(set.contains("c.less"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn missing_includes_are_not_found() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("a.tpl"), "x").expect("write");
        let store = ResourceStore::new(dir.path()).expect("store");
        let primary = store.resolve("a.tpl").expect("a");

        let mut context = CompilationContext::new(store, primary);
        let err = context.fetch("missing.tpl").expect_err("missing");
        assert!(err.is_not_found());
        assert_eq!(context.include_count(), 0);
    }

    #[test]
    fn unread_primary_is_observed_on_close() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("a.tpl"), "x").expect("write");
        let store = ResourceStore::new(dir.path()).expect("store");
        let primary = store.resolve("a.tpl").expect("a");

        let set = CompilationContext::new(store, primary)
            .dependency_set()
            .expect("set");
        assert_eq!(set.len(), 1);
        assert!(!set.has_changed());
    }
}
