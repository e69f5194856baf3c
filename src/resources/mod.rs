//! File-backed resources under a managed root.
//!
//! A [`ResourceStore`] canonicalizes request paths and refuses anything that
//! escapes its root. The [`Resource`] handles it yields are cheap metadata
//! wrappers; reading one produces an [`ObservedResource`] that remembers the
//! modification time seen at read time, and a [`DependencySet`] aggregates
//! those observations for one compiled artifact.

mod deps;
mod resource;
mod store;

use std::{io, path::PathBuf};

use thiserror::Error;

pub use deps::DependencySet;
pub use resource::{ObservedResource, Resource};
pub use store::ResourceStore;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource `{0}` not found")]
    NotFound(String),
    #[error("i/o error reading `{path}`")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("resource `{0}` is not valid UTF-8")]
    Encoding(String),
    #[error("invalid root directory `{}`", path.display())]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResourceError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound(path);
        }
        Self::Io { path, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
