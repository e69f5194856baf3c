//! Source-to-artifact converters.
//!
//! Converters are pure text transformations. The only side channel they get
//! is an [`IncludeFetcher`], through which every sub-resource read (an
//! `@import`, a partial) must go so the caller can track it as a dependency.

mod json;
mod script;
mod stylesheet;

use thiserror::Error;

use crate::resources::ResourceError;

pub use json::JsonNormalizer;
pub use script::ScriptMinifier;
pub use stylesheet::LessConverter;

/// Content returned by an [`IncludeFetcher`].
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Canonical key of the resource that was read.
    pub key: String,
    pub content: String,
}

/// Callback used by converters to read sub-resources.
pub trait IncludeFetcher {
    /// Resolve `name` (root-relative) and return its content.
    fn fetch(&mut self, name: &str) -> Result<Fetched, ResourceError>;
}

/// Options passed through to a [`Converter`].
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Canonical key of the primary source, used to resolve relative includes.
    pub source_key: String,
    pub minify: bool,
}

impl ConvertOptions {
    pub fn new(source_key: impl Into<String>, minify: bool) -> Self {
        Self {
            source_key: source_key.into(),
            minify,
        }
    }
}

pub trait Converter: Send + Sync {
    fn convert(
        &self,
        source: &str,
        options: &ConvertOptions,
        includes: &mut dyn IncludeFetcher,
    ) -> Result<String, ConversionError>;
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("{language} syntax error on line {line}: {message}")]
    Syntax {
        language: &'static str,
        line: usize,
        message: String,
    },
    #[error("invalid JSON")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

impl ConversionError {
    pub fn syntax(language: &'static str, line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            language,
            line,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Join `name` against the directory holding `from`, both root-relative.
pub(crate) fn sibling_path(from: &str, name: &str) -> String {
    if let Some(absolute) = name.strip_prefix('/') {
        return absolute.to_string();
    }
    match from.rfind('/') {
        Some(slash) => format!("{}/{}", &from[..slash], name),
        None => name.to_string(),
    }
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())]
        .bytes()
        .filter(|byte| *byte == b'\n')
        .count()
        + 1
}
