use std::{
    fmt, fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use tracing::trace;

use super::ResourceError;

/// One regular file under a [`ResourceStore`](super::ResourceStore) root.
///
/// Identity is the canonical key (root-relative, `/`-separated). Handles are
/// created on every resolution and carry no read state of their own.
#[derive(Clone)]
pub struct Resource {
    key: Arc<str>,
    path: Arc<Path>,
}

impl Resource {
    pub(super) fn new(key: String, path: PathBuf) -> Self {
        Self {
            key: Arc::from(key),
            path: Arc::from(path),
        }
    }

    /// Canonical, root-relative key. Doubles as the cache key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rfind('.').map(|dot| &name[dot + 1..])
    }

    /// Current on-disk modification time.
    pub fn modified(&self) -> Result<SystemTime, ResourceError> {
        fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .map_err(|err| ResourceError::io(self.key(), err))
    }

    /// Snapshot the current modification time without reading content.
    pub fn observe(&self) -> Result<ObservedResource, ResourceError> {
        Ok(ObservedResource {
            resource: self.clone(),
            modified: self.modified()?,
        })
    }

    /// Read the raw bytes, recording the modification time seen just before the read.
    pub fn read_bytes(&self) -> Result<(Bytes, ObservedResource), ResourceError> {
        let observed = self.observe()?;
        let content = fs::read(&self.path).map_err(|err| ResourceError::io(self.key(), err))?;
        trace!(key = self.key(), bytes = content.len(), "read resource");
        Ok((Bytes::from(content), observed))
    }

    pub fn read_string(&self) -> Result<(String, ObservedResource), ResourceError> {
        let (content, observed) = self.read_bytes()?;
        let text = String::from_utf8(content.to_vec())
            .map_err(|_| ResourceError::Encoding(self.key.to_string()))?;
        Ok((text, observed))
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resource").field(&self.key).finish()
    }
}

/// A resource together with the modification time observed when it was read.
#[derive(Debug, Clone)]
pub struct ObservedResource {
    resource: Resource,
    modified: SystemTime,
}

impl ObservedResource {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn key(&self) -> &str {
        self.resource.key()
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// True when the file's modification time differs from the observed one,
    /// or when the file can no longer be inspected at all.
    pub fn has_changed(&self) -> bool {
        match self.resource.modified() {
            Ok(current) => current != self.modified,
            Err(_) => true,
        }
    }
}
