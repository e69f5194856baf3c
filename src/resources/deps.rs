//! Dependency sets for compiled artifacts.

use std::{collections::HashSet, time::SystemTime};

use super::ObservedResource;

/// The primary resource of an artifact plus every resource read while
/// compiling it.
///
/// Built once at the end of a compilation and never mutated afterwards; a
/// recompilation produces a fresh set, so resources that are no longer
/// referenced drop out.
#[derive(Debug, Clone)]
pub struct DependencySet {
    primary: ObservedResource,
    includes: Vec<ObservedResource>,
}

impl DependencySet {
    /// Includes are deduplicated by key (first observation wins) and never
    /// repeat the primary.
    pub fn new(primary: ObservedResource, includes: Vec<ObservedResource>) -> Self {
        let mut seen = HashSet::new();
        seen.insert(primary.key().to_string());
        let includes = includes
            .into_iter()
            .filter(|observed| seen.insert(observed.key().to_string()))
            .collect();
        Self { primary, includes }
    }

    pub fn primary(&self) -> &ObservedResource {
        &self.primary
    }

    pub fn includes(&self) -> &[ObservedResource] {
        &self.includes
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObservedResource> {
        std::iter::once(&self.primary).chain(self.includes.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.includes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, key: &str) -> bool {
        self.iter().any(|observed| observed.key() == key)
    }

    /// True when any member's modification time moved since it was read.
    pub fn has_changed(&self) -> bool {
        self.iter().any(ObservedResource::has_changed)
    }

    /// Newest observed modification time across the whole set.
    pub fn last_modified(&self) -> SystemTime {
        self.iter()
            .map(ObservedResource::modified)
            .max()
            .unwrap_or_else(|| self.primary.modified())
    }
}
