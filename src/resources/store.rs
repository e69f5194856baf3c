use std::{
    fs,
    path::{Component, Path},
    sync::Arc,
};

use tracing::debug;

use super::{Resource, ResourceError};

/// Resolves request paths to [`Resource`]s contained within a fixed root.
///
/// Resolution is a pure lookup and runs on every request: the canonical
/// result must be a regular file and one of its ancestors must be the root.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    root: Arc<Path>,
}

impl ResourceStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root).map_err(|source| ResourceError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        if !canonical.is_dir() {
            return Err(ResourceError::InvalidRoot {
                path: root.to_path_buf(),
                source: std::io::Error::other("not a directory"),
            });
        }
        Ok(Self {
            root: Arc::from(canonical),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` relative to the root.
    ///
    /// Returns `None` when the file is missing, is not a regular file, or
    /// canonicalizes to a location outside the root.
    pub fn resolve(&self, name: &str) -> Option<Resource> {
        let relative = name.trim_start_matches('/');
        if relative.is_empty() || relative.contains('\0') {
            return None;
        }

        let candidate = self.root.join(relative);
        let canonical = match fs::canonicalize(&candidate) {
            Ok(path) => path,
            Err(_) => return None,
        };

        if !canonical.is_file() {
            debug!(
                target = "hearth::resources",
                requested = name,
                "resolved path is not a regular file"
            );
            return None;
        }

        if !canonical
            .ancestors()
            .skip(1)
            .any(|parent| parent == &*self.root)
        {
            debug!(
                target = "hearth::resources",
                requested = name,
                resolved = %canonical.display(),
                "resolved path escapes the resource root"
            );
            return None;
        }

        let key = key_for(&self.root, &canonical)?;
        Some(Resource::new(key, canonical))
    }

    /// Resolve `name` or, failing that, the first alternative that exists.
    pub fn resolve_any<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<Resource> {
        names.into_iter().find_map(|name| self.resolve(name))
    }
}

fn key_for(root: &Path, canonical: &Path) -> Option<String> {
    let relative = canonical.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?.to_string()),
            _ => return None,
        }
    }
    Some(segments.join("/"))
}
